//! RTCM 3 frame codec.
//!
//! Wire layout: `0xD3`, a 16-bit big-endian length field whose top six bits
//! are reserved (zero) and low ten bits give the payload length, the payload,
//! then a 24-bit CRC-24Q trailer over everything before it. The first twelve
//! bits of the payload carry the message number.

use bytes::Bytes;
use nalgebra::Vector3;

use crate::error::FrameError;

pub const PREAMBLE: u8 = 0xD3;
pub const HEADER_LEN: usize = 3;
pub const CRC_LEN: usize = 3;
pub const MAX_PAYLOAD_LEN: usize = 0x3FF;

const RESERVED_MASK: u16 = 0xFC00;
const CRC24Q_POLY: u32 = 0x0186_4CFB;

const CRC24Q_TABLE: [u32; 256] = build_crc24q_table();

const fn build_crc24q_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
            bit += 1;
        }
        table[i] = crc & 0x00FF_FFFF;
        i += 1;
    }
    table
}

/// CRC-24Q (Qualcomm) as used by RTCM 3.
pub fn crc24q(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &byte| {
        let index = (((crc >> 16) as u8) ^ byte) as usize;
        ((crc << 8) ^ CRC24Q_TABLE[index]) & 0x00FF_FFFF
    })
}

/// A checksum-verified correction frame. Cheap to clone; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_number: u16,
    pub payload: Bytes,
    pub raw: Bytes,
}

impl Frame {
    /// Wraps `payload` in preamble, length and CRC trailer.
    ///
    /// Payloads longer than [`MAX_PAYLOAD_LEN`] are rejected.
    pub fn encode(payload: &[u8]) -> Option<Frame> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return None;
        }
        let mut raw = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        raw.push(PREAMBLE);
        raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        raw.extend_from_slice(payload);
        let crc = crc24q(&raw);
        raw.extend_from_slice(&crc.to_be_bytes()[1..]);
        let raw = Bytes::from(raw);
        Some(Frame {
            message_number: message_number(payload),
            payload: raw.slice(HEADER_LEN..HEADER_LEN + payload.len()),
            raw,
        })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn description(&self) -> Option<&'static str> {
        describe(self.message_number)
    }
}

/// Outcome of one extraction attempt at the head of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    Frame(Frame),
    /// The buffer holds a prefix of a frame; nothing was consumed.
    NeedMoreData,
    /// The leading byte is not a preamble.
    Noise,
    /// A candidate frame failed validation.
    Invalid(FrameError),
}

/// Attempts to read one frame from the head of `buf`.
///
/// Returns the outcome and the number of bytes the caller must discard.
/// Anything other than a verified frame consumes exactly one byte so the
/// caller resynchronizes on the next candidate preamble.
pub fn try_extract(buf: &[u8]) -> (Extract, usize) {
    let Some(&first) = buf.first() else {
        return (Extract::NeedMoreData, 0);
    };
    if first != PREAMBLE {
        return (Extract::Noise, 1);
    }
    if buf.len() < HEADER_LEN {
        return (Extract::NeedMoreData, 0);
    }

    let length_field = u16::from_be_bytes([buf[1], buf[2]]);
    if length_field & RESERVED_MASK != 0 {
        return (Extract::Invalid(FrameError::ReservedBits(length_field)), 1);
    }

    let payload_len = usize::from(length_field);
    let total = HEADER_LEN + payload_len + CRC_LEN;
    if buf.len() < total {
        return (Extract::NeedMoreData, 0);
    }

    let body_end = HEADER_LEN + payload_len;
    let expected = u32::from_be_bytes([0, buf[body_end], buf[body_end + 1], buf[body_end + 2]]);
    let actual = crc24q(&buf[..body_end]);
    if expected != actual {
        return (Extract::Invalid(FrameError::Checksum { expected, actual }), 1);
    }

    let raw = Bytes::copy_from_slice(&buf[..total]);
    let payload = raw.slice(HEADER_LEN..body_end);
    let frame = Frame {
        message_number: message_number(&payload),
        payload,
        raw,
    };
    (Extract::Frame(frame), total)
}

fn message_number(payload: &[u8]) -> u16 {
    match payload {
        [hi, lo, ..] => (u16::from(*hi) << 4) | (u16::from(*lo) >> 4),
        _ => 0,
    }
}

/// Human-readable label for a message number.
pub fn describe(message_number: u16) -> Option<&'static str> {
    let label = match message_number {
        1001 => "GPS L1 RTK Observables",
        1002 => "GPS Extended L1 RTK Observables",
        1003 => "GPS L1/L2 RTK Observables",
        1004 => "GPS Extended L1/L2 RTK Observables",
        1005 => "Stationary RTK Reference Station ARP",
        1006 => "Stationary RTK Reference Station ARP with Height",
        1007 => "Antenna Descriptor",
        1008 => "Antenna Descriptor & Serial Number",
        1009 => "GLONASS L1 RTK Observables",
        1010 => "GLONASS Extended L1 RTK Observables",
        1011 => "GLONASS L1/L2 RTK Observables",
        1012 => "GLONASS Extended L1/L2 RTK Observables",
        1013 => "System Parameters",
        1019 => "GPS Ephemeris",
        1020 => "GLONASS Ephemeris",
        1033 => "Receiver and Antenna Descriptors",
        1074 => "GPS MSM4",
        1075 => "GPS MSM5",
        1076 => "GPS MSM6",
        1077 => "GPS MSM7",
        1084 => "GLONASS MSM4",
        1085 => "GLONASS MSM5",
        1086 => "GLONASS MSM6",
        1087 => "GLONASS MSM7",
        1094 => "Galileo MSM4",
        1095 => "Galileo MSM5",
        1096 => "Galileo MSM6",
        1097 => "Galileo MSM7",
        1124 => "BeiDou MSM4",
        1125 => "BeiDou MSM5",
        1126 => "BeiDou MSM6",
        1127 => "BeiDou MSM7",
        1230 => "GLONASS Code-Phase Biases",
        _ => return None,
    };
    Some(label)
}

/// Antenna reference point announced in messages 1005 and 1006.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationArp {
    pub station_id: u16,
    pub itrf_year: u8,
    /// Earth-centred, earth-fixed metres.
    pub ecef: Vector3<f64>,
    /// Only present in 1006.
    pub antenna_height: Option<f64>,
}

impl StationArp {
    pub fn decode(frame: &Frame) -> Option<StationArp> {
        let with_height = match frame.message_number {
            1005 => false,
            1006 => true,
            _ => return None,
        };
        let needed_bits = if with_height { 168 } else { 152 };
        if frame.payload.len() * 8 < needed_bits {
            return None;
        }

        let mut bits = BitReader::new(&frame.payload);
        bits.skip(12);
        let station_id = bits.read(12) as u16;
        let itrf_year = bits.read(6) as u8;
        bits.skip(4);
        let x = bits.read_signed(38);
        bits.skip(2);
        let y = bits.read_signed(38);
        bits.skip(2);
        let z = bits.read_signed(38);
        let antenna_height = with_height.then(|| bits.read(16) as f64 * 1e-4);

        Some(StationArp {
            station_id,
            itrf_year,
            ecef: Vector3::new(x as f64, y as f64, z as f64) * 1e-4,
            antenna_height,
        })
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn skip(&mut self, bits: usize) {
        self.pos += bits;
    }

    fn read(&mut self, bits: usize) -> u64 {
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.data.get(self.pos / 8).copied().unwrap_or(0);
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        value
    }

    fn read_signed(&mut self, bits: usize) -> i64 {
        let raw = self.read(bits);
        let shift = 64 - bits as u32;
        ((raw << shift) as i64) >> shift
    }
}
