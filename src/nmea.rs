//! Receiver status sentences and setup commands.
//!
//! The receiver interleaves NMEA 0183 text with binary RTCM frames on the
//! same serial link. Only the sentences that feed fix telemetry are decoded:
//! GGA (fix quality, satellites, HDOP), GSA (HDOP, VDOP) and GST (position
//! standard deviations).

use thiserror::Error;

use crate::gnss::{Covariance, FixType, Position, ReceiverReport};

/// Longest sentence accepted before the line is treated as noise.
pub const MAX_SENTENCE_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SentenceError {
    #[error("sentence does not start with '$'")]
    MissingStart,

    #[error("unreadable checksum field {0:?}")]
    ChecksumField(String),

    #[error("checksum mismatch: sentence says {expected:#04x}, computed {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
}

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Frames `body` as a complete sentence with checksum and line ending.
pub fn command(body: &str) -> String {
    format!("${body}*{:02X}\r\n", checksum(body))
}

/// Commands that put the receiver into base mode at a surveyed position and
/// enable RTCM output for each listed message type.
pub fn base_station_commands(position: &Position, messages: &[u16]) -> Vec<String> {
    let mut commands = Vec::with_capacity(messages.len() + 2);
    commands.push(command("PAIR065,0,1"));
    commands.push(command(&format!(
        "PAIR062,{:.9},{:.9},{:.4}",
        position.latitude, position.longitude, position.altitude
    )));
    commands.extend(
        messages
            .iter()
            .map(|message| command(&format!("PAIR050,{message},1"))),
    );
    commands
}

/// Validates and decodes one sentence. Sentences that carry no telemetry
/// yield `Ok(None)`.
pub fn parse(sentence: &str) -> Result<Option<ReceiverReport>, SentenceError> {
    let sentence = sentence.trim_end();
    let body = sentence
        .strip_prefix('$')
        .ok_or(SentenceError::MissingStart)?;

    let body = match body.split_once('*') {
        Some((body, field)) => {
            let expected = u8::from_str_radix(field, 16)
                .map_err(|_| SentenceError::ChecksumField(field.to_owned()))?;
            let actual = checksum(body);
            if expected != actual {
                return Err(SentenceError::Checksum { expected, actual });
            }
            body
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields[0];
    if kind.len() != 5 {
        return Ok(None);
    }

    let report = match kind.get(2..).unwrap_or_default() {
        "GGA" => parse_gga(&fields),
        "GSA" => parse_gsa(&fields),
        "GST" => parse_gst(&fields),
        _ => None,
    };
    Ok(report)
}

fn field<T: std::str::FromStr>(fields: &[&str], index: usize) -> Option<T> {
    fields
        .get(index)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
}

fn parse_gga(fields: &[&str]) -> Option<ReceiverReport> {
    let quality: u8 = field(fields, 6)?;
    Some(ReceiverReport {
        fix_type: Some(FixType::from_gga_quality(quality).unwrap_or(FixType::NoFix)),
        satellites: Some(field(fields, 7).unwrap_or(0)),
        // An empty field means no HDOP this epoch.
        hdop: Some(field(fields, 8).unwrap_or(0.0)),
        ..Default::default()
    })
}

fn parse_gsa(fields: &[&str]) -> Option<ReceiverReport> {
    let hdop = field(fields, 16);
    let vdop = field(fields, 17);
    if hdop.is_none() && vdop.is_none() {
        return None;
    }
    Some(ReceiverReport {
        hdop,
        vdop,
        ..Default::default()
    })
}

fn parse_gst(fields: &[&str]) -> Option<ReceiverReport> {
    let covariance = Covariance {
        lat_sd: field(fields, 6)?,
        lon_sd: field(fields, 7)?,
        alt_sd: field(fields, 8)?,
    };
    Some(ReceiverReport {
        covariance: Some(covariance),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_commands_with_checksum() {
        assert_eq!(command("PAIR065,0,1"), format!("$PAIR065,0,1*{:02X}\r\n", checksum("PAIR065,0,1")));

        let position = Position {
            latitude: 43.5,
            longitude: -116.25,
            altitude: 742.5,
        };
        let commands = base_station_commands(&position, &[1005, 1074]);
        assert_eq!(commands.len(), 4);
        assert!(commands[1].starts_with("$PAIR062,43.500000000,-116.250000000,742.5000*"));
        assert!(commands[3].starts_with("$PAIR050,1074,1*"));
        assert!(commands.iter().all(|c| c.ends_with("\r\n")));
    }

    #[test]
    fn parses_gga() {
        let report = parse(&command("GNGGA,123519,4807.038,N,01131.000,E,4,12,0.6,545.4,M,46.9,M,,"))
            .unwrap()
            .unwrap();
        assert_eq!(report.fix_type, Some(FixType::RtkFixed));
        assert_eq!(report.satellites, Some(12));
        assert_eq!(report.hdop, Some(0.6));
        assert_eq!(report.covariance, None);
    }

    #[test]
    fn gga_without_fix_reports_zero_hdop() {
        let report = parse(&command("GPGGA,123519,,,,,0,00,,,M,,M,,")).unwrap().unwrap();
        assert_eq!(report.fix_type, Some(FixType::NoFix));
        assert_eq!(report.satellites, Some(0));
        assert_eq!(report.hdop, Some(0.0));
    }

    #[test]
    fn parses_gsa_and_gst() {
        let gsa = parse(&command("GNGSA,A,3,01,02,03,04,05,,,,,,,,1.8,0.9,1.5,1"))
            .unwrap()
            .unwrap();
        assert_eq!(gsa.hdop, Some(0.9));
        assert_eq!(gsa.vdop, Some(1.5));

        let gst = parse(&command("GNGST,172814.0,0.006,0.023,0.020,273.6,0.023,0.020,0.031"))
            .unwrap()
            .unwrap();
        assert_eq!(
            gst.covariance,
            Some(Covariance {
                lat_sd: 0.023,
                lon_sd: 0.020,
                alt_sd: 0.031
            })
        );
    }

    #[test]
    fn rejects_bad_checksum() {
        let err = parse("$GPGGA,123519,,,,,1,05,1.2,,M,,M,,*00").unwrap_err();
        assert!(matches!(err, SentenceError::Checksum { expected: 0, .. }));
        assert_eq!(parse("GPGGA,1").unwrap_err(), SentenceError::MissingStart);
    }

    #[test]
    fn ignores_other_sentences() {
        assert_eq!(parse(&command("GNRMC,123519,A,4807.038,N,01131.000,E,,,230394,,")).unwrap(), None);
        assert_eq!(parse(&command("PAIR001,050,0")).unwrap(), None);
    }
}
