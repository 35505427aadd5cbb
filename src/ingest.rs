//! Receiver ingest.
//!
//! A single task owns the receiver link. It reads the raw byte stream,
//! separates binary RTCM frames from interleaved NMEA sentences, and publishes
//! frames in arrival order. When the device disappears the task drops any
//! partial frame and reopens the device with exponential backoff.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::prelude::*;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Framed, FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use utoipa::ToSchema;

use crate::error::{DeviceError, FrameError};
use crate::gnss::ReceiverReport;
use crate::nmea::{self, MAX_SENTENCE_LEN};
use crate::rtcm::{self, Extract, Frame};
use crate::stats::Statistics;

pub type DeviceStream = Box<dyn AsyncRead + Send + Unpin>;

/// Something that can be (re)opened to yield the receiver byte stream.
#[async_trait]
pub trait ReceiverDevice: Send + Sync {
    fn describe(&self) -> String;

    async fn open(&self) -> io::Result<DeviceStream>;
}

const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);
const COMMAND_SPACING: Duration = Duration::from_millis(100);

/// Serial port attached receiver.
#[derive(Debug, Clone)]
pub struct SerialDevice {
    path: String,
    baudrate: u32,
    /// Written to the port after every successful open.
    setup: Vec<String>,
}

impl SerialDevice {
    pub fn new(path: impl Into<String>, baudrate: u32, setup: Vec<String>) -> Self {
        Self {
            path: path.into(),
            baudrate,
            setup,
        }
    }

    fn open_blocking(&self) -> io::Result<Box<dyn serialport::SerialPort>> {
        let mut port = serialport::new(&self.path, self.baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()?;

        for command in &self.setup {
            port.write_all(command.as_bytes())?;
            debug!(command = command.trim_end(), "sent receiver command");
            std::thread::sleep(COMMAND_SPACING);
        }
        Ok(port)
    }
}

#[async_trait]
impl ReceiverDevice for SerialDevice {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baudrate)
    }

    async fn open(&self) -> io::Result<DeviceStream> {
        let device = self.clone();
        let port = tokio::task::spawn_blocking(move || device.open_blocking())
            .await
            .map_err(io::Error::other)??;

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(64);
        std::thread::Builder::new()
            .name("serial-reader".to_owned())
            .spawn(move || read_port(port, tx))?;

        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(Box::new(StreamReader::new(Box::pin(chunks))))
    }
}

/// Blocking reader loop. Exits when the port fails or the async side hangs up.
fn read_port(mut port: Box<dyn serialport::SerialPort>, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut buf = [0u8; 1024];
    while !tx.is_closed() {
        match port.read(&mut buf) {
            Ok(0) => {
                let _ = tx.blocking_send(Err(io::ErrorKind::UnexpectedEof.into()));
                break;
            }
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    debug!("serial reader stopped");
}

/// Items separated out of the receiver byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Frame(Frame),
    Sentence(String),
    Rejected(FrameError),
}

/// Splits the receiver stream into frames and sentences. Bytes that belong
/// to neither are skipped one at a time.
#[derive(Debug, Default)]
pub struct ReceiverCodec {
    skipped: u64,
}

impl ReceiverCodec {
    /// Bytes skipped since the last call.
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }

    /// Length of a complete sentence at the head of `src`, `Ok(None)` if more
    /// bytes are needed, `Err(())` if the head cannot start a sentence.
    fn sentence_len(src: &[u8]) -> Result<Option<usize>, ()> {
        for (i, &byte) in src.iter().enumerate().skip(1).take(MAX_SENTENCE_LEN) {
            if byte == b'\n' {
                return Ok(Some(i + 1));
            }
            if !byte.is_ascii() || byte == b'$' {
                return Err(());
            }
        }
        if src.len() > MAX_SENTENCE_LEN {
            Err(())
        } else {
            Ok(None)
        }
    }
}

impl Decoder for ReceiverCodec {
    type Item = ReceiverEvent;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&head) = src.first() else {
                return Ok(None);
            };

            if head == b'$' {
                match Self::sentence_len(src) {
                    Ok(Some(len)) => {
                        let line = src.split_to(len);
                        // Only ASCII reaches here.
                        let text = String::from_utf8_lossy(&line).trim_end().to_owned();
                        return Ok(Some(ReceiverEvent::Sentence(text)));
                    }
                    Ok(None) => return Ok(None),
                    Err(()) => {
                        src.advance(1);
                        self.skipped += 1;
                        continue;
                    }
                }
            }

            let (outcome, used) = rtcm::try_extract(src);
            src.advance(used);
            match outcome {
                Extract::Frame(frame) => return Ok(Some(ReceiverEvent::Frame(frame))),
                Extract::NeedMoreData => return Ok(None),
                Extract::Noise => self.skipped += 1,
                Extract::Invalid(error) => return Ok(Some(ReceiverEvent::Rejected(error))),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(event) => Ok(Some(event)),
            None => {
                if !buf.is_empty() {
                    trace!(bytes = buf.len(), "dropping partial data at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No open attempt has completed yet.
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: LinkState,
    pub since: Instant,
    pub last_connected: Option<Instant>,
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn connecting() -> Self {
        Self {
            state: LinkState::Connecting,
            since: Instant::now(),
            last_connected: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

enum PumpEnd {
    Shutdown,
    DownstreamClosed,
    Lost(DeviceError),
}

pub struct SerialIngest<D> {
    device: D,
    frames: mpsc::Sender<Frame>,
    reports: Option<mpsc::Sender<ReceiverReport>>,
    statistics: Arc<Statistics>,
    link: watch::Sender<LinkStatus>,
    backoff: Backoff,
}

impl<D: ReceiverDevice> SerialIngest<D> {
    pub fn new(
        device: D,
        frames: mpsc::Sender<Frame>,
        statistics: Arc<Statistics>,
        link: watch::Sender<LinkStatus>,
    ) -> Self {
        Self {
            device,
            frames,
            reports: None,
            statistics,
            link,
            backoff: Backoff::default(),
        }
    }

    /// Forward decoded NMEA telemetry to this channel.
    pub fn with_reports(mut self, reports: mpsc::Sender<ReceiverReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn set_state(&self, state: LinkState, error: Option<String>) {
        self.link.send_modify(|status| {
            let now = Instant::now();
            if state != status.state {
                status.since = now;
            }
            if state == LinkState::Connected {
                status.last_connected = Some(now);
            }
            status.state = state;
            if error.is_some() {
                status.last_error = error;
            }
        });
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let name = self.device.describe();
        let mut delay = self.backoff.initial;
        let mut ever_connected = false;

        loop {
            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                opened = self.device.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    if ever_connected {
                        self.statistics.record_reconnect();
                    }
                    ever_connected = true;
                    delay = self.backoff.initial;
                    info!(device = %name, "receiver connected");
                    self.set_state(LinkState::Connected, None);

                    match self.pump(stream, &shutdown).await {
                        PumpEnd::Shutdown | PumpEnd::DownstreamClosed => break,
                        PumpEnd::Lost(error) => {
                            warn!(device = %name, %error, "receiver link lost");
                            self.set_state(LinkState::Disconnected, Some(error.to_string()));
                        }
                    }
                }
                Err(source) => {
                    let error = DeviceError::Open {
                        path: name.clone(),
                        source,
                    };
                    warn!(%error, retry_in = ?delay, "receiver unavailable");
                    self.set_state(LinkState::Disconnected, Some(error.to_string()));
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.backoff.next(delay);
        }

        self.set_state(LinkState::Stopped, None);
        info!(device = %name, "ingest stopped");
        Ok(())
    }

    async fn pump(&mut self, stream: DeviceStream, shutdown: &CancellationToken) -> PumpEnd {
        let mut framed = FramedRead::new(stream, ReceiverCodec::default());
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return PumpEnd::Shutdown,
                event = framed.next() => event,
            };
            self.statistics
                .record_skipped(framed.decoder_mut().take_skipped());

            match event {
                Some(Ok(ReceiverEvent::Frame(frame))) => {
                    trace!(message_number = frame.message_number, len = frame.len(), "frame");
                    if self.frames.send(frame).await.is_err() {
                        return PumpEnd::DownstreamClosed;
                    }
                }
                Some(Ok(ReceiverEvent::Sentence(sentence))) => self.forward_sentence(&sentence),
                Some(Ok(ReceiverEvent::Rejected(error))) => {
                    debug!(%error, "discarded candidate frame");
                    self.statistics.record_rejection(&error);
                }
                Some(Err(error)) => return PumpEnd::Lost(DeviceError::Read(error)),
                None => return PumpEnd::Lost(DeviceError::Closed),
            }
        }
    }

    fn forward_sentence(&self, sentence: &str) {
        let Some(reports) = &self.reports else {
            return;
        };
        match nmea::parse(sentence) {
            Ok(Some(report)) => {
                if reports.try_send(report).is_err() {
                    trace!("telemetry queue full, dropping report");
                }
            }
            Ok(None) => trace!(sentence, "ignored sentence"),
            Err(error) => debug!(%error, sentence, "bad sentence"),
        }
    }
}

/// Reads telemetry from a gpsd JSON watch stream instead of the serial link.
pub async fn run_gpsd_feed(
    address: String,
    reports: mpsc::Sender<ReceiverReport>,
    backoff: Backoff,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut delay = backoff.initial;
    loop {
        let session = async {
            let stream = TcpStream::connect(&address).await?;
            let mut framed = Framed::new(stream, LinesCodec::new());
            framed.send(gpsd_proto::ENABLE_WATCH_CMD).await?;
            info!(%address, "watching gpsd");
            while let Some(line) = framed.next().await {
                let line = line?;
                match serde_json::from_str::<gpsd_proto::UnifiedResponse>(&line) {
                    Ok(response) => {
                        if let Some(report) = ReceiverReport::from_gpsd(&response) {
                            if reports.send(report).await.is_err() {
                                return anyhow::Ok(false);
                            }
                        }
                    }
                    Err(e) => trace!(error = %e, "undecodable gpsd line"),
                }
            }
            anyhow::Ok(true)
        };

        let started = Instant::now();
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = session => match result {
                Ok(false) => return Ok(()),
                Ok(true) => warn!(%address, "gpsd closed the connection"),
                Err(error) => warn!(%address, %error, retry_in = ?delay, "gpsd unavailable"),
            },
        }
        if started.elapsed() > backoff.max {
            delay = backoff.initial;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = backoff.next(delay);
    }
}
