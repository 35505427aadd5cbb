mod common;

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use rtk_base_caster::ingest::{Backoff, DeviceStream, LinkState, LinkStatus, ReceiverDevice, SerialIngest};
use rtk_base_caster::stats::Totals;
use tokio::sync::{mpsc, watch};

/// Replays one scripted byte sequence per successful open, then reports the
/// device missing.
struct ReplayDevice {
    sessions: Mutex<VecDeque<Vec<Vec<u8>>>>,
}

#[async_trait]
impl ReceiverDevice for ReplayDevice {
    fn describe(&self) -> String {
        "replay".to_owned()
    }

    async fn open(&self) -> io::Result<DeviceStream> {
        let Some(reads) = self.sessions.lock().unwrap().pop_front() else {
            return Err(io::ErrorKind::NotFound.into());
        };
        let mut builder = tokio_test::io::Builder::new();
        for read in &reads {
            builder.read(read);
        }
        builder.read_error(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled"));
        Ok(Box::new(builder.build()))
    }
}

#[tokio::test]
async fn frames_survive_a_receiver_disconnect() {
    let harness = start(config(false, 256)).await;
    let mut rover = send_request(harness.address, "GET /BOISE HTTP/1.0\r\n\r\n").await;
    assert_eq!(read_head(&mut rover).await, "ICY 200 OK\r\n\r\n");
    wait_until(|| harness.station.registry.len() == 1).await;

    let frames: Vec<_> = (0..10).map(|seq| frame(1074 + (seq % 4) * 10, seq, 60)).collect();
    let before: Vec<u8> = concat(&frames[..5]);
    let mut cut_short = frames[5].raw[..20].to_vec();
    cut_short.insert(0, 0x00);
    let mut after = vec![0xFF, 0xD3, 0xFC];
    after.extend(concat(&frames[5..]));

    let device = ReplayDevice {
        sessions: Mutex::new(VecDeque::from(vec![
            vec![before[..100].to_vec(), before[100..].to_vec(), cut_short],
            vec![after],
        ])),
    };

    let (link_tx, link_rx) = watch::channel(LinkStatus::connecting());
    let ingest = SerialIngest::new(
        device,
        harness.frames.clone(),
        harness.station.statistics.clone(),
        link_tx,
    )
    .with_backoff(Backoff {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
    });

    let samples = Arc::new(Mutex::new(Vec::<Totals>::new()));
    let sampler = {
        let samples = samples.clone();
        let statistics = harness.station.statistics.clone();
        tokio::spawn(async move {
            loop {
                samples.lock().unwrap().push(statistics.totals());
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };
    let ingest_task = tokio::spawn(ingest.run(harness.shutdown.clone()));

    let expected = concat(&frames);
    assert_eq!(read_exactly(&mut rover, expected.len()).await, expected);

    wait_until(|| harness.station.statistics.snapshot().reconnects == 1).await;
    wait_until(|| link_rx.borrow().state == LinkState::Disconnected).await;
    sampler.abort();

    let totals = harness.station.statistics.totals();
    assert_eq!(totals.messages, 10);
    assert_eq!(totals.bytes, expected.len() as u64);
    let samples = samples.lock().unwrap();
    assert!(samples
        .windows(2)
        .all(|w| w[0].messages <= w[1].messages && w[0].bytes <= w[1].bytes));

    harness.shutdown.cancel();
    ingest_task.await.unwrap().unwrap();
    assert_eq!(link_rx.borrow().state, LinkState::Stopped);
}
