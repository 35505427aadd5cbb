//! Shared handles for one running base station.
//!
//! Every task gets a clone of [`Station`]; the producing halves of the watch
//! channels travel separately in [`StationFeeds`] so each has one owner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::config::Config;
use crate::gnss::{FixStatus, Position};
use crate::ingest::LinkStatus;
use crate::registry::ClientRegistry;
use crate::stats::Statistics;
use crate::telemetry::initial_status;

/// Antenna position the receiver is actually announcing in 1005/1006.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct ReferenceStation {
    pub station_id: u16,
    pub message_number: u16,
    pub position: Position,
    /// Distance from the configured base position, metres.
    pub offset_m: f64,
    pub antenna_height_m: Option<f64>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Station {
    pub config: Arc<Config>,
    pub statistics: Arc<Statistics>,
    pub registry: Arc<ClientRegistry>,
    pub telemetry: watch::Receiver<FixStatus>,
    pub link: watch::Receiver<LinkStatus>,
    pub reference: watch::Receiver<Option<ReferenceStation>>,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StationFeeds {
    pub telemetry: watch::Sender<FixStatus>,
    pub link: watch::Sender<LinkStatus>,
    pub reference: watch::Sender<Option<ReferenceStation>>,
}

impl Station {
    pub fn new(config: Config) -> (Station, StationFeeds) {
        let (telemetry_tx, telemetry) = watch::channel(initial_status());
        let (link_tx, link) = watch::channel(LinkStatus::connecting());
        let (reference_tx, reference) = watch::channel(None);
        let registry = Arc::new(ClientRegistry::new(config.ntrip.client_queue));

        let station = Station {
            config: Arc::new(config),
            statistics: Arc::new(Statistics::new()),
            registry,
            telemetry,
            link,
            reference,
            started: Instant::now(),
            started_at: Utc::now(),
        };
        let feeds = StationFeeds {
            telemetry: telemetry_tx,
            link: link_tx,
            reference: reference_tx,
        };
        (station, feeds)
    }
}
