//! Error taxonomy shared by the ingest, caster and configuration layers.
//!
//! Frame errors are recoverable values: the decoder yields them and resyncs.
//! Only `ConfigError` is fatal, and only at startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A candidate frame was rejected by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The top six bits of the length field must be zero.
    #[error("reserved length bits set in {0:#06x}")]
    ReservedBits(u16),

    /// CRC-24Q trailer does not match the computed value.
    #[error("checksum mismatch: trailer {expected:#08x}, computed {actual:#08x}")]
    Checksum { expected: u32, actual: u32 },
}

/// Receiver device failures. The ingest task reconnects after any of these.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("device read failed: {0}")]
    Read(#[source] io::Error),

    #[error("device closed the stream")]
    Closed,
}

/// Problems before a request could be classified.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for request")]
    Timeout,

    #[error("peer closed before sending a request")]
    Closed,

    #[error("request header exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credentials required")]
    Missing,

    #[error("unsupported authorization scheme")]
    Malformed,

    #[error("invalid credentials for user {0:?}")]
    Rejected(String),
}

/// Reasons a serving session ends abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("write blocked longer than the configured timeout")]
    WriteTimeout,

    #[error("evicted by the broadcaster")]
    Evicted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
