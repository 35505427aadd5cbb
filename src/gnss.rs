use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use utoipa::ToSchema;

#[derive(serde::Deserialize, serde::Serialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Receiver-reported solution class. Numbering follows the GGA quality field.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FixType {
    #[default]
    NoFix = 0,
    Gps = 1,
    Dgps = 2,
    Pps = 3,
    RtkFixed = 4,
    RtkFloat = 5,
    DeadReckoning = 6,
    Manual = 7,
    Simulation = 8,
    /// gpsd only distinguishes 2D and 3D.
    Fix2d = 20,
    Fix3d = 30,
}

impl FixType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::NoFix => "No Fix",
            Self::Gps => "GPS Fix",
            Self::Dgps => "DGPS Fix",
            Self::Pps => "PPS Fix",
            Self::RtkFixed => "RTK Fixed",
            Self::RtkFloat => "RTK Float",
            Self::DeadReckoning => "Dead Reckoning",
            Self::Manual => "Manual Input",
            Self::Simulation => "Simulation",
            Self::Fix2d => "2D Fix",
            Self::Fix3d => "3D Fix",
        }
    }

    pub fn from_gga_quality(value: u8) -> ::core::option::Option<Self> {
        match value {
            0 => Some(Self::NoFix),
            1 => Some(Self::Gps),
            2 => Some(Self::Dgps),
            3 => Some(Self::Pps),
            4 => Some(Self::RtkFixed),
            5 => Some(Self::RtkFloat),
            6 => Some(Self::DeadReckoning),
            7 => Some(Self::Manual),
            8 => Some(Self::Simulation),
            _ => None,
        }
    }

    pub fn has_fix(&self) -> bool {
        !matches!(self, Self::NoFix)
    }

    /// Nominal range error in metres used to scale dilution figures when the
    /// receiver reports no covariance.
    pub fn nominal_range_error(&self) -> f64 {
        match self {
            Self::RtkFixed => 0.02,
            Self::RtkFloat => 0.25,
            Self::Dgps => 0.7,
            _ => 3.0,
        }
    }
}

impl fmt::Display for FixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

impl Serialize for FixType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<gpsd_proto::Mode> for FixType {
    fn from(value: gpsd_proto::Mode) -> Self {
        match value {
            gpsd_proto::Mode::NoFix => FixType::NoFix,
            gpsd_proto::Mode::Fix2d => FixType::Fix2d,
            gpsd_proto::Mode::Fix3d => FixType::Fix3d,
        }
    }
}

/// One-sigma position errors in metres.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Covariance {
    pub lat_sd: f64,
    pub lon_sd: f64,
    pub alt_sd: f64,
}

/// Telemetry fields extracted from one receiver status line. Absent fields
/// were not carried by that line and leave the tracked value untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReceiverReport {
    pub fix_type: Option<FixType>,
    pub satellites: Option<u32>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub covariance: Option<Covariance>,
}

impl ReceiverReport {
    pub fn from_gpsd(response: &gpsd_proto::UnifiedResponse) -> Option<Self> {
        match response {
            gpsd_proto::UnifiedResponse::Tpv(t) => {
                let covariance = match (t.epy, t.epx, t.epv) {
                    (Some(lat), Some(lon), Some(alt)) => Some(Covariance {
                        lat_sd: f64::from(lat),
                        lon_sd: f64::from(lon),
                        alt_sd: f64::from(alt),
                    }),
                    _ => None,
                };
                Some(ReceiverReport {
                    fix_type: Some(t.mode.clone().into()),
                    covariance,
                    ..Default::default()
                })
            }
            gpsd_proto::UnifiedResponse::Sky(s) => Some(ReceiverReport {
                satellites: s
                    .satellites
                    .as_ref()
                    .map(|sats| sats.iter().filter(|sat| sat.used).count() as u32),
                hdop: s.hdop.map(f64::from),
                vdop: s.vdop.map(f64::from),
                ..Default::default()
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PositionAccuracy {
    pub horizontal_m: f64,
    pub vertical_m: f64,
    pub error_3d_m: f64,
}

impl PositionAccuracy {
    pub fn new(horizontal_m: f64, vertical_m: f64) -> Self {
        Self {
            horizontal_m,
            vertical_m,
            error_3d_m: horizontal_m.hypot(vertical_m),
        }
    }

    pub fn from_covariance(covariance: &Covariance) -> Self {
        Self::new(covariance.lat_sd.hypot(covariance.lon_sd), covariance.alt_sd)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FixStatus {
    pub fix_type: FixType,
    pub satellite_count: u32,
    pub hdop: f64,
    pub stale: bool,
    pub position_accuracy: Option<PositionAccuracy>,
}

impl FixStatus {
    pub fn quality(&self) -> AccuracyQuality {
        AccuracyQuality::classify(self.position_accuracy.as_ref())
    }
}

/// Read-side banding of the 3D error. The thresholds are part of the
/// dashboard contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyQuality {
    Excellent,
    Good,
    Moderate,
    Poor,
    Calculating,
}

impl AccuracyQuality {
    pub fn classify(accuracy: Option<&PositionAccuracy>) -> Self {
        let Some(accuracy) = accuracy else {
            return Self::Calculating;
        };
        match accuracy.error_3d_m {
            e if e < 0.1 => Self::Excellent,
            e if e < 0.5 => Self::Good,
            e if e < 2.0 => Self::Moderate,
            _ => Self::Poor,
        }
    }

    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Moderate => "moderate",
            Self::Poor => "poor",
            Self::Calculating => "calculating",
        }
    }
}
