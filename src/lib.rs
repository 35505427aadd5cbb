pub mod api;
pub mod caster;
pub mod config;
pub mod error;
pub mod export;
pub mod geodesy;
pub mod gnss;
pub mod helpers;
pub mod ingest;
pub mod nmea;
pub mod ntrip;
pub mod registry;
pub mod rtcm;
pub mod station;
pub mod stats;
pub mod telemetry;

pub use config::Config;
pub use rtcm::Frame;
pub use station::{Station, StationFeeds};
