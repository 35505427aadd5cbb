//! Fix-quality tracking.
//!
//! The tracker is owned by a single task that applies receiver reports and
//! periodically re-evaluates staleness. Readers only ever see the last
//! published [`FixStatus`] through a watch channel.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gnss::{Covariance, FixStatus, FixType, PositionAccuracy, ReceiverReport};

pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Stamped<T> {
    value: T,
    at: Instant,
}

#[derive(Debug)]
pub struct TelemetryTracker {
    freshness: Duration,
    /// Stamped by the epoch reports (GGA, gpsd TPV); staleness follows it.
    fix: Option<Stamped<FixType>>,
    satellites: Option<Stamped<u32>>,
    hdop: Option<Stamped<f64>>,
    vdop: Option<Stamped<f64>>,
    covariance: Option<Stamped<Covariance>>,
}

impl TelemetryTracker {
    pub fn new(freshness: Duration) -> Self {
        Self {
            freshness,
            fix: None,
            satellites: None,
            hdop: None,
            vdop: None,
            covariance: None,
        }
    }

    pub fn fix_type(&self) -> FixType {
        self.fix.map(|fix| fix.value).unwrap_or_default()
    }

    pub fn apply(&mut self, report: &ReceiverReport, now: Instant) {
        if let Some(fix_type) = report.fix_type {
            self.fix = Some(Stamped { value: fix_type, at: now });
            if !fix_type.has_fix() {
                self.hdop = None;
                self.vdop = None;
                self.covariance = None;
            }
        }
        if let Some(satellites) = report.satellites {
            self.satellites = Some(Stamped { value: satellites, at: now });
        }
        if let Some(hdop) = report.hdop {
            self.hdop = Some(Stamped { value: hdop, at: now });
        }
        if let Some(vdop) = report.vdop {
            self.vdop = Some(Stamped { value: vdop, at: now });
        }
        if let Some(covariance) = report.covariance {
            self.covariance = Some(Stamped {
                value: covariance,
                at: now,
            });
        }
    }

    fn fresh<T: Copy>(&self, stamped: Option<Stamped<T>>, now: Instant) -> Option<T> {
        stamped
            .filter(|s| now.saturating_duration_since(s.at) <= self.freshness)
            .map(|s| s.value)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.fresh(self.fix, now).is_none()
    }

    /// Accuracy is only derived while this epoch has a fix, satellites and
    /// HDOP. Covariance wins over scaled dilution.
    fn accuracy(&self, now: Instant) -> Option<PositionAccuracy> {
        let fix_type = self.fresh(self.fix, now).filter(FixType::has_fix)?;
        self.fresh(self.satellites, now).filter(|n| *n > 0)?;
        let hdop = self.fresh(self.hdop, now).filter(|hdop| *hdop > 0.0)?;

        if let Some(covariance) = self.fresh(self.covariance, now) {
            return Some(PositionAccuracy::from_covariance(&covariance));
        }

        let vdop = self.fresh(self.vdop, now)?;
        let range_error = fix_type.nominal_range_error();
        Some(PositionAccuracy::new(hdop * range_error, vdop * range_error))
    }

    pub fn status(&self, now: Instant) -> FixStatus {
        FixStatus {
            fix_type: self.fix_type(),
            satellite_count: self.satellites.map_or(0, |s| s.value),
            hdop: self.hdop.map_or(0.0, |h| h.value),
            stale: self.is_stale(now),
            position_accuracy: self.accuracy(now),
        }
    }
}

/// Initial value published before the receiver reports anything.
pub fn initial_status() -> FixStatus {
    FixStatus {
        stale: true,
        ..Default::default()
    }
}

pub async fn run_telemetry(
    mut tracker: TelemetryTracker,
    mut reports: mpsc::Receiver<ReceiverReport>,
    published: watch::Sender<FixStatus>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(EVALUATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            report = reports.recv() => {
                let Some(report) = report else { break };
                let previous = tracker.fix_type();
                tracker.apply(&report, Instant::now());
                if tracker.fix_type() != previous {
                    info!(from = %previous, to = %tracker.fix_type(), "fix type changed");
                }
            }
            _ = interval.tick() => {}
        }

        let status = tracker.status(Instant::now());
        published.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.stale != status.stale {
                debug!(stale = status.stale, "telemetry freshness changed");
            }
            *current = status;
            true
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::AccuracyQuality;

    const FRESHNESS: Duration = Duration::from_secs(5);

    fn gga(fix_type: FixType, satellites: u32, hdop: Option<f64>) -> ReceiverReport {
        ReceiverReport {
            fix_type: Some(fix_type),
            satellites: Some(satellites),
            hdop,
            ..Default::default()
        }
    }

    fn gst(lat_sd: f64, lon_sd: f64, alt_sd: f64) -> ReceiverReport {
        ReceiverReport {
            covariance: Some(Covariance {
                lat_sd,
                lon_sd,
                alt_sd,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn starts_stale_and_calculating() {
        let tracker = TelemetryTracker::new(FRESHNESS);
        let status = tracker.status(Instant::now());
        assert!(status.stale);
        assert_eq!(status.position_accuracy, None);
        assert_eq!(status.quality(), AccuracyQuality::Calculating);
    }

    #[test]
    fn covariance_yields_accuracy() {
        let now = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(&gga(FixType::RtkFixed, 14, Some(0.7)), now);
        tracker.apply(&gst(0.012, 0.016, 0.021), now);

        let status = tracker.status(now);
        assert!(!status.stale);
        assert_eq!(status.satellite_count, 14);
        let accuracy = status.position_accuracy.unwrap();
        assert!((accuracy.horizontal_m - 0.02).abs() < 1e-9);
        assert!((accuracy.vertical_m - 0.021).abs() < 1e-9);
        assert_eq!(status.quality(), AccuracyQuality::Excellent);
    }

    #[test]
    fn dilution_fallback_needs_vdop() {
        let now = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(&gga(FixType::Gps, 9, Some(1.0)), now);
        assert_eq!(tracker.status(now).position_accuracy, None);

        tracker.apply(
            &ReceiverReport {
                hdop: Some(1.0),
                vdop: Some(1.5),
                ..Default::default()
            },
            now,
        );
        let accuracy = tracker.status(now).position_accuracy.unwrap();
        assert!((accuracy.horizontal_m - 3.0).abs() < 1e-9);
        assert!((accuracy.vertical_m - 4.5).abs() < 1e-9);
        assert_eq!(tracker.status(now).quality(), AccuracyQuality::Poor);
    }

    #[test]
    fn losing_fix_clears_accuracy() {
        let now = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(&gga(FixType::RtkFloat, 10, Some(0.9)), now);
        tracker.apply(&gst(0.2, 0.2, 0.3), now);
        assert!(tracker.status(now).position_accuracy.is_some());

        tracker.apply(&gga(FixType::NoFix, 0, None), now);
        let status = tracker.status(now);
        assert_eq!(status.fix_type, FixType::NoFix);
        assert_eq!(status.position_accuracy, None);
        assert_eq!(status.hdop, 0.0);
    }

    #[test]
    fn goes_stale_after_freshness_window() {
        let start = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(&gga(FixType::RtkFixed, 12, Some(0.6)), start);
        tracker.apply(&gst(0.01, 0.01, 0.02), start);

        let later = start + FRESHNESS + Duration::from_millis(1);
        let status = tracker.status(later);
        assert!(status.stale);
        assert_eq!(status.position_accuracy, None);

        tracker.apply(&gga(FixType::RtkFixed, 12, Some(0.6)), later);
        let status = tracker.status(later);
        assert!(!status.stale);
        // The covariance is from the previous window and no longer counts.
        assert_eq!(status.position_accuracy, None);
    }

    #[test]
    fn old_epoch_is_stale_despite_fresh_covariance() {
        let start = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(&gga(FixType::RtkFixed, 12, Some(0.6)), start);

        let later = start + Duration::from_secs(6);
        tracker.apply(&gst(0.01, 0.01, 0.02), later);
        tracker.apply(
            &ReceiverReport {
                hdop: Some(0.6),
                vdop: Some(1.1),
                ..Default::default()
            },
            later,
        );

        let status = tracker.status(later);
        assert!(status.stale);
        assert_eq!(status.position_accuracy, None);
        assert_eq!(status.quality(), AccuracyQuality::Calculating);
    }

    #[test]
    fn satellites_must_be_from_this_epoch() {
        let start = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(
            &ReceiverReport {
                satellites: Some(10),
                ..Default::default()
            },
            start,
        );

        let later = start + Duration::from_secs(6);
        tracker.apply(
            &ReceiverReport {
                fix_type: Some(FixType::RtkFixed),
                hdop: Some(0.6),
                covariance: Some(Covariance {
                    lat_sd: 0.01,
                    lon_sd: 0.01,
                    alt_sd: 0.02,
                }),
                ..Default::default()
            },
            later,
        );
        let status = tracker.status(later);
        assert!(!status.stale);
        assert_eq!(status.position_accuracy, None);
    }

    #[test]
    fn empty_hdop_clears_previous_value() {
        let now = Instant::now();
        let mut tracker = TelemetryTracker::new(FRESHNESS);
        tracker.apply(&gga(FixType::RtkFixed, 12, Some(0.6)), now);
        tracker.apply(&gst(0.01, 0.01, 0.02), now);
        assert!(tracker.status(now).position_accuracy.is_some());

        let report = crate::nmea::parse(&crate::nmea::command(
            "GNGGA,123520,4807.038,N,01131.000,E,4,12,,545.4,M,46.9,M,,",
        ))
        .unwrap()
        .unwrap();
        tracker.apply(&report, now);
        let status = tracker.status(now);
        assert_eq!(status.hdop, 0.0);
        assert_eq!(status.position_accuracy, None);
    }

    #[tokio::test(start_paused = true)]
    async fn task_publishes_updates_and_staleness() {
        let (report_tx, report_rx) = mpsc::channel(8);
        let (status_tx, mut status_rx) = watch::channel(initial_status());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_telemetry(
            TelemetryTracker::new(FRESHNESS),
            report_rx,
            status_tx,
            shutdown.clone(),
        ));

        report_tx.send(gga(FixType::RtkFixed, 11, Some(0.8))).await.unwrap();
        status_rx.changed().await.unwrap();
        assert!(!status_rx.borrow_and_update().stale);

        tokio::time::sleep(FRESHNESS + Duration::from_secs(2)).await;
        assert!(status_rx.borrow().stale);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
