#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use rtk_base_caster::caster::{self, Caster};
use rtk_base_caster::{Config, Frame, Station, StationFeeds};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn config(authentication: bool, client_queue: usize) -> Config {
    let text = format!(
        r#"
[base_station]
latitude = 43.564978733
longitude = -116.599707708
altitude = 742.4959

[ntrip]
host = "127.0.0.1"
port = 0
mountpoint = "BOISE"
client_queue = {client_queue}
handshake_timeout_secs = 2
write_timeout_secs = 2

[ntrip.authentication]
enabled = {authentication}
username = "rover"
password = "hunter2"

[rtcm]
messages = []
"#
    );
    Config::parse(&text).expect("test config")
}

/// A frame of `len` payload bytes whose body starts with `seq`.
pub fn frame(message_number: u16, seq: u16, len: usize) -> Frame {
    let mut payload = vec![(message_number >> 4) as u8, ((message_number & 0x0F) << 4) as u8];
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.resize(len.max(4), 0x5A);
    Frame::encode(&payload).expect("payload fits")
}

pub fn concat(frames: &[Frame]) -> Vec<u8> {
    frames.iter().flat_map(|frame| frame.raw.to_vec()).collect()
}

pub struct Harness {
    pub station: Station,
    pub address: SocketAddr,
    pub frames: mpsc::Sender<Frame>,
    pub shutdown: CancellationToken,
}

/// Caster on an ephemeral loopback port plus the relay task.
pub async fn start(config: Config) -> Harness {
    let (station, feeds) = Station::new(config);
    let StationFeeds { reference, .. } = feeds;
    let caster = Caster::bind(station.clone()).await.expect("bind");
    let address = caster.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let (frames, frame_rx) = mpsc::channel(1024);

    tokio::spawn(caster.run(shutdown.clone()));
    tokio::spawn(caster::relay_frames(
        frame_rx,
        station.clone(),
        reference,
        shutdown.clone(),
    ));

    Harness {
        station,
        address,
        frames,
        shutdown,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Keeps frames flowing until `condition` holds. Closed rovers are only
/// noticed when a write to them fails.
pub async fn relay_until(harness: &Harness, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut seq = 0u16;
        while !condition() {
            harness.frames.send(frame(1230, seq, 8)).await.expect("relay running");
            seq = seq.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn send_request(address: SocketAddr, head: &str) -> TcpStream {
    let mut stream = TcpStream::connect(address).await.expect("connect");
    stream.write_all(head.as_bytes()).await.expect("write request");
    stream
}

/// Reads a response header block byte by byte, leaving the body unread.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.expect("response byte"));
    }
    String::from_utf8(head).expect("ascii head")
}

pub async fn read_all(stream: &mut TcpStream) -> String {
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("server closed in time")
        .expect("read");
    String::from_utf8_lossy(&response).into_owned()
}

pub async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("frames in time")
        .expect("read");
    buf
}

pub fn basic(user: &str, password: &str) -> String {
    use base64::Engine;
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    format!("Basic {token}")
}
