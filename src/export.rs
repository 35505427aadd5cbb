//! Read-only reports for the dashboard. Built from snapshots, so building
//! one never blocks the relay path.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::gnss::{AccuracyQuality, FixStatus, FixType, Position, PositionAccuracy};
use crate::helpers::{format_uptime, round2};
use crate::ingest::{LinkState, LinkStatus};
use crate::rtcm;
use crate::station::{ReferenceStation, Station};

/// How long the link may sit without frames, or disconnected, before the
/// status gets worse.
pub const STATUS_GRACE: Duration = Duration::from_secs(30);

/// Below this decayed rate the stream counts as stalled.
const MIN_RUNNING_RATE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Running,
    Degraded,
    Error,
}

impl ServiceStatus {
    pub fn classify(link: &LinkStatus, message_rate: f64, now: Instant) -> Self {
        let in_grace = now.saturating_duration_since(link.since) < STATUS_GRACE;
        match link.state {
            LinkState::Connecting => Self::Starting,
            LinkState::Connected if message_rate >= MIN_RUNNING_RATE => Self::Running,
            LinkState::Connected if in_grace => Self::Starting,
            LinkState::Connected => Self::Degraded,
            LinkState::Disconnected if in_grace => Self::Degraded,
            LinkState::Disconnected | LinkState::Stopped => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GpsStatus {
    #[schema(value_type = String, example = "RTK Fixed")]
    pub fix_type: FixType,
    pub satellites: u32,
    pub hdop: f64,
    pub stale: bool,
    /// `null` while the receiver has not produced an estimate.
    pub position_accuracy: Option<PositionAccuracy>,
    pub accuracy_quality: AccuracyQuality,
}

impl From<&FixStatus> for GpsStatus {
    fn from(status: &FixStatus) -> Self {
        GpsStatus {
            fix_type: status.fix_type,
            satellites: status.satellite_count,
            hdop: status.hdop,
            stale: status.stale,
            position_accuracy: status.position_accuracy,
            accuracy_quality: status.quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ClientReport {
    pub address: String,
    pub mountpoint: String,
    pub connected_at: DateTime<Utc>,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusReport {
    pub status: ServiceStatus,
    /// Seconds since start.
    pub uptime: f64,
    pub uptime_formatted: String,
    pub start_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub gps_status: GpsStatus,
    pub rtcm_messages: u64,
    pub bytes_broadcast: u64,
    pub message_rate: f64,
    pub byte_rate: f64,
    pub active_clients: usize,
    pub clients: Vec<ClientReport>,
}

impl StatusReport {
    pub fn collect(station: &Station) -> Self {
        Self::at(station, Instant::now(), Utc::now())
    }

    pub fn at(station: &Station, now: Instant, timestamp: DateTime<Utc>) -> Self {
        let statistics = station.statistics.snapshot();
        let link = station.link.borrow().clone();
        let gps_status = GpsStatus::from(&*station.telemetry.borrow());
        let clients: Vec<ClientReport> = station
            .registry
            .snapshot()
            .into_iter()
            .map(|session| ClientReport {
                address: session.remote_address.to_string(),
                mountpoint: session.mountpoint,
                connected_at: session.connected_at,
                bytes_sent: session.bytes_sent,
            })
            .collect();
        let uptime = now.saturating_duration_since(station.started);

        StatusReport {
            status: ServiceStatus::classify(&link, statistics.rates.message_rate, now),
            uptime: round2(uptime.as_secs_f64()),
            uptime_formatted: format_uptime(uptime),
            start_time: station.started_at,
            timestamp,
            gps_status,
            rtcm_messages: statistics.totals.messages,
            bytes_broadcast: statistics.totals.bytes,
            message_rate: round2(statistics.rates.message_rate),
            byte_rate: round2(statistics.rates.byte_rate),
            active_clients: clients.len(),
            clients,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SerialReport {
    pub port: String,
    pub baudrate: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NtripReport {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub identifier: String,
    pub authentication_enabled: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RtcmReport {
    pub messages: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConfigReport {
    pub serial: SerialReport,
    pub base_station: Position,
    pub ntrip: NtripReport,
    pub rtcm: RtcmReport,
}

impl ConfigReport {
    pub fn collect(station: &Station) -> Self {
        let config = &station.config;
        ConfigReport {
            serial: SerialReport {
                port: config.serial.port.clone(),
                baudrate: config.serial.baudrate,
            },
            base_station: config.base_station,
            ntrip: NtripReport {
                host: config.ntrip.host.clone(),
                port: config.ntrip.port,
                mountpoint: config.ntrip.mountpoint.clone(),
                identifier: config.identifier().to_owned(),
                authentication_enabled: config.ntrip.authentication.enabled,
            },
            rtcm: RtcmReport {
                messages: config.rtcm.messages.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LinkReport {
    pub state: LinkState,
    pub seconds_in_state: f64,
    /// `null` until the receiver has been opened once.
    pub seconds_since_connected: Option<f64>,
    pub last_error: Option<String>,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CounterReport {
    pub filtered: u64,
    pub skipped_bytes: u64,
    pub framing_errors: u64,
    pub checksum_errors: u64,
    pub auth_failures: u64,
    pub rejected_handshakes: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessageTypeReport {
    pub message_number: u16,
    pub description: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DiagnosticsReport {
    pub link: LinkReport,
    pub counters: CounterReport,
    pub message_types: Vec<MessageTypeReport>,
    pub reference_station: Option<ReferenceStation>,
}

impl DiagnosticsReport {
    pub fn collect(station: &Station) -> Self {
        let statistics = station.statistics.snapshot();
        let link = station.link.borrow().clone();
        DiagnosticsReport {
            link: LinkReport {
                state: link.state,
                seconds_in_state: round2(link.since.elapsed().as_secs_f64()),
                seconds_since_connected: link
                    .last_connected
                    .map(|at| round2(at.elapsed().as_secs_f64())),
                last_error: link.last_error,
                reconnects: statistics.reconnects,
            },
            counters: CounterReport {
                filtered: statistics.filtered,
                skipped_bytes: statistics.skipped_bytes,
                framing_errors: statistics.framing_errors,
                checksum_errors: statistics.checksum_errors,
                auth_failures: statistics.auth_failures,
                rejected_handshakes: statistics.rejected_handshakes,
                evictions: statistics.evictions,
            },
            message_types: statistics
                .per_type
                .iter()
                .map(|&(message_number, count)| MessageTypeReport {
                    message_number,
                    description: rtcm::describe(message_number).map(str::to_owned),
                    count,
                })
                .collect(),
            reference_station: *station.reference.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Config;
    use crate::registry::NewSession;
    use crate::rtcm::tests::frame_for;
    use crate::stats::Rates;
    use std::net::SocketAddr;

    fn link(state: LinkState, since: Instant) -> LinkStatus {
        LinkStatus {
            state,
            since,
            last_connected: None,
            last_error: None,
        }
    }

    #[test]
    fn status_classification() {
        let start = Instant::now();
        let early = start + Duration::from_secs(5);
        let late = start + STATUS_GRACE + Duration::from_secs(1);

        let cases = [
            (LinkState::Connecting, 0.0, late, ServiceStatus::Starting),
            (LinkState::Connected, 1.0, early, ServiceStatus::Running),
            (LinkState::Connected, 0.0, early, ServiceStatus::Starting),
            (LinkState::Connected, 0.0, late, ServiceStatus::Degraded),
            (LinkState::Disconnected, 0.0, early, ServiceStatus::Degraded),
            (LinkState::Disconnected, 0.0, late, ServiceStatus::Error),
            (LinkState::Stopped, 5.0, early, ServiceStatus::Error),
        ];
        for (state, rate, now, expected) in cases {
            assert_eq!(
                ServiceStatus::classify(&link(state, start), rate, now),
                expected,
                "{state:?} at {rate}"
            );
        }
    }

    #[test]
    fn status_report_shape() {
        let (station, feeds) = Station::new(Config::parse(SAMPLE).unwrap());
        let frame = frame_for(1074, 30);
        station.statistics.record_frame(&frame);
        station.statistics.publish_rates(Rates {
            message_rate: 1.23456,
            byte_rate: 45.678,
        });
        let sub = station.registry.register(NewSession {
            remote_address: SocketAddr::from(([10, 1, 2, 3], 40000)),
            mountpoint: "BOISE".to_owned(),
            authenticated: true,
            username: Some("rover".to_owned()),
        });
        sub.handle.add_bytes_sent(512);
        feeds.link.send_modify(|status| status.state = LinkState::Connected);

        let now = station.started + Duration::from_secs(3725);
        let report = StatusReport::at(&station, now, Utc::now());
        assert_eq!(report.status, ServiceStatus::Running);
        assert_eq!(report.uptime_formatted, "1:02:05");
        assert_eq!(report.message_rate, 1.23);
        assert_eq!(report.byte_rate, 45.68);
        assert_eq!(report.rtcm_messages, 1);
        assert_eq!(report.bytes_broadcast, frame.len() as u64);
        assert_eq!(report.active_clients, 1);
        assert_eq!(report.clients[0].address, "10.1.2.3:40000");
        assert_eq!(report.clients[0].bytes_sent, 512);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["gps_status"]["fix_type"], "No Fix");
        assert!(json["gps_status"]["stale"].as_bool().unwrap());
        assert!(json["gps_status"]["position_accuracy"].is_null());
        assert_eq!(json["gps_status"]["accuracy_quality"], "calculating");
    }

    #[test]
    fn config_report_shape() {
        let (station, _feeds) = Station::new(Config::parse(SAMPLE).unwrap());
        let json = serde_json::to_value(ConfigReport::collect(&station)).unwrap();
        assert_eq!(json["base_station"]["latitude"], 43.564978733);
        assert_eq!(json["ntrip"]["port"], 2101);
        assert_eq!(json["ntrip"]["mountpoint"], "BOISE");
        assert_eq!(json["ntrip"]["authentication_enabled"], true);
        assert_eq!(json["rtcm"]["messages"], serde_json::json!([1005, 1074, 1084]));
        assert!(json.to_string().find("hunter2").is_none());
    }

    #[test]
    fn diagnostics_label_message_types() {
        let (station, _feeds) = Station::new(Config::parse(SAMPLE).unwrap());
        station.statistics.record_frame(&frame_for(1005, 17));
        station.statistics.record_frame(&frame_for(4094, 3));
        station.statistics.record_auth_failure();
        station.statistics.record_skipped(7);

        let report = DiagnosticsReport::collect(&station);
        assert_eq!(report.link.state, LinkState::Connecting);
        assert_eq!(report.link.seconds_since_connected, None);
        assert_eq!(report.counters.auth_failures, 1);
        assert_eq!(report.counters.skipped_bytes, 7);
        assert_eq!(report.message_types.len(), 2);
        assert_eq!(
            report.message_types[0].description.as_deref(),
            Some("Stationary RTK Reference Station ARP")
        );
        assert_eq!(report.message_types[1].description, None);
        assert!(report.reference_station.is_none());
    }
}
