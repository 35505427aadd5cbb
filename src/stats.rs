//! Relay counters and decayed throughput rates.
//!
//! Totals are atomics bumped by the relay path; rates are recomputed by a
//! separate ticker so they fall toward zero when input stalls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FrameError;
use crate::rtcm::Frame;

pub const RATE_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub message_rate: f64,
    pub byte_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub messages: u64,
    pub bytes: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default)]
pub struct StatisticsSnapshot {
    pub totals: Totals,
    pub rates: Rates,
    pub filtered: u64,
    /// Bytes that started neither a frame nor a sentence.
    pub skipped_bytes: u64,
    pub framing_errors: u64,
    pub checksum_errors: u64,
    pub auth_failures: u64,
    pub rejected_handshakes: u64,
    pub evictions: u64,
    pub reconnects: u64,
    /// Sorted by message number.
    pub per_type: Vec<(u16, u64)>,
}

#[derive(Debug)]
pub struct Statistics {
    messages_total: AtomicU64,
    bytes_total: AtomicU64,
    filtered: AtomicU64,
    skipped_bytes: AtomicU64,
    framing_errors: AtomicU64,
    checksum_errors: AtomicU64,
    auth_failures: AtomicU64,
    rejected_handshakes: AtomicU64,
    evictions: AtomicU64,
    reconnects: AtomicU64,
    per_type: DashMap<u16, u64>,
    rates: watch::Sender<Rates>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            messages_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            skipped_bytes: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            rejected_handshakes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            per_type: DashMap::new(),
            rates: watch::Sender::new(Rates::default()),
        }
    }

    pub fn record_frame(&self, frame: &Frame) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        *self.per_type.entry(frame.message_number).or_insert(0) += 1;
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, bytes: u64) {
        if bytes > 0 {
            self.skipped_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_rejection(&self, error: &FrameError) {
        let counter = match error {
            FrameError::ReservedBits(_) => &self.framing_errors,
            FrameError::Checksum { .. } => &self.checksum_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_handshake(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> Totals {
        Totals {
            messages: self.messages_total.load(Ordering::Relaxed),
            bytes: self.bytes_total.load(Ordering::Relaxed),
        }
    }

    pub fn rates(&self) -> Rates {
        *self.rates.borrow()
    }

    pub fn publish_rates(&self, rates: Rates) {
        self.rates.send_replace(rates);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let mut per_type: Vec<(u16, u64)> = self
            .per_type
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        per_type.sort_unstable();
        StatisticsSnapshot {
            totals: self.totals(),
            rates: self.rates(),
            filtered: self.filtered.load(Ordering::Relaxed),
            skipped_bytes: self.skipped_bytes.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            per_type,
        }
    }
}

/// Exponential moving average of message and byte throughput.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    last: Option<(Instant, Totals)>,
    rates: Rates,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            rates: Rates::default(),
        }
    }

    pub fn observe(&mut self, totals: Totals, now: Instant) -> Rates {
        let Some((then, previous)) = self.last.replace((now, totals)) else {
            return self.rates;
        };
        let dt = now.saturating_duration_since(then).as_secs_f64();
        if dt <= 0.0 {
            self.last = Some((then, previous));
            return self.rates;
        }

        let alpha = 1.0 - (-dt / self.window.as_secs_f64()).exp();
        let message_rate = totals.messages.saturating_sub(previous.messages) as f64 / dt;
        let byte_rate = totals.bytes.saturating_sub(previous.bytes) as f64 / dt;
        self.rates.message_rate += alpha * (message_rate - self.rates.message_rate);
        self.rates.byte_rate += alpha * (byte_rate - self.rates.byte_rate);
        self.rates
    }
}

pub async fn run_rate_meter(statistics: Arc<Statistics>, shutdown: CancellationToken) {
    let mut meter = RateMeter::new(RATE_WINDOW);
    let mut interval = tokio::time::interval(RATE_TICK);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let rates = meter.observe(statistics.totals(), Instant::now());
                statistics.publish_rates(rates);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcm::tests::frame_for;

    #[test]
    fn counts_frames_by_type() {
        let stats = Statistics::new();
        let a = frame_for(1074, 30);
        let b = frame_for(1005, 17);
        stats.record_frame(&a);
        stats.record_frame(&a);
        stats.record_frame(&b);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.totals.messages, 3);
        assert_eq!(snapshot.totals.bytes, (2 * a.len() + b.len()) as u64);
        assert_eq!(snapshot.per_type, vec![(1005, 1), (1074, 2)]);
    }

    #[test]
    fn counts_rejections_by_kind() {
        let stats = Statistics::new();
        stats.record_rejection(&FrameError::ReservedBits(0x0400));
        stats.record_rejection(&FrameError::Checksum {
            expected: 1,
            actual: 2,
        });
        stats.record_rejection(&FrameError::Checksum {
            expected: 3,
            actual: 4,
        });
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.framing_errors, 1);
        assert_eq!(snapshot.checksum_errors, 2);
    }

    #[test]
    fn rates_converge_then_decay() {
        let start = Instant::now();
        let mut meter = RateMeter::new(RATE_WINDOW);
        let mut totals = Totals::default();
        meter.observe(totals, start);

        for second in 1..=60 {
            totals.messages += 5;
            totals.bytes += 500;
            meter.observe(totals, start + Duration::from_secs(second));
        }
        let rates = meter.observe(totals, start + Duration::from_secs(60));
        assert!((rates.message_rate - 5.0).abs() < 0.1, "{rates:?}");
        assert!((rates.byte_rate - 500.0).abs() < 10.0, "{rates:?}");

        let mut rates = rates;
        for second in 61..=120 {
            rates = meter.observe(totals, start + Duration::from_secs(second));
        }
        assert!(rates.message_rate < 0.05, "{rates:?}");
        assert!(rates.byte_rate < 5.0, "{rates:?}");
        assert!(rates.message_rate >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_publishes_rates() {
        let stats = Arc::new(Statistics::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_rate_meter(stats.clone(), shutdown.clone()));

        let frame = frame_for(1230, 10);
        for _ in 0..20 {
            tokio::time::sleep(RATE_TICK).await;
            stats.record_frame(&frame);
            stats.record_frame(&frame);
        }
        assert!(stats.rates().message_rate > 1.0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
