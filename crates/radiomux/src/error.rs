//! Error types for the multiplexer.
//!
//! Every expected failure reaches the issuing caller as a [`RequestError`]
//! delivered through its completion; nothing here crosses the engine
//! boundary as a panic.

use std::fmt;

use thiserror::Error;

use crate::serial::Serial;

// ── Modem status ────────────────────────────────────────────────────

/// Status code reported by the modem alongside a solicited response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RadioError(pub i32);

impl RadioError {
    pub const NONE: RadioError = RadioError(0);
    pub const RADIO_NOT_AVAILABLE: RadioError = RadioError(1);
    pub const GENERIC_FAILURE: RadioError = RadioError(2);
    pub const REQUEST_NOT_SUPPORTED: RadioError = RadioError(6);
    pub const INVALID_ARGUMENTS: RadioError = RadioError(44);
    pub const SYSTEM_ERR: RadioError = RadioError(39);

    pub fn is_none(self) -> bool {
        self == RadioError::NONE
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            RadioError::NONE => "NONE",
            RadioError::RADIO_NOT_AVAILABLE => "RADIO_NOT_AVAILABLE",
            RadioError::GENERIC_FAILURE => "GENERIC_FAILURE",
            RadioError::REQUEST_NOT_SUPPORTED => "REQUEST_NOT_SUPPORTED",
            RadioError::INVALID_ARGUMENTS => "INVALID_ARGUMENTS",
            RadioError::SYSTEM_ERR => "SYSTEM_ERR",
            RadioError(code) => return write!(f, "radio error {code}"),
        };
        f.write_str(name)
    }
}

// ── Request outcome errors ──────────────────────────────────────────

/// Why a request did not complete with a modem payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Rejected by the compatibility gate; never registered.
    #[error("request not supported by the bound service version")]
    NotSupported,
    /// Endpoint not bound, transport failure, or domain reset.
    #[error("radio service unavailable")]
    ServiceUnavailable,
    /// Serial collision. Indicates an allocator defect.
    #[error("duplicate serial {0}")]
    InternalDuplicate(Serial),
    /// The modem answered with a non-zero status.
    #[error("modem reported {0}")]
    Radio(RadioError),
    /// A typed decoder could not make sense of the payload.
    #[error("invalid response payload: {0}")]
    InvalidResponse(String),
}

// ── Transport boundary ──────────────────────────────────────────────

/// Synchronous failure while handing a message to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection itself is broken; the whole domain is reset.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The codec refused this one message; the connection is fine.
    #[error("request rejected by codec: {0}")]
    Rejected(String),
}

/// Failure to obtain a connection for one protocol revision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// This revision is not offered; the next lower one is tried.
    #[error("service not found")]
    NotFound,
    /// The service exists but could not be reached right now.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

// ── Internal bookkeeping ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("serial {0} already pending")]
    Duplicate(Serial),
    /// The serial was reissued after a restart and the newer request owns
    /// it.
    #[error("serial {0} reissued by a newer epoch")]
    Superseded(Serial),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("telemetry sink failed: {0}")]
pub struct TelemetryError(pub String);

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown domain {0:?}")]
    UnknownDomain(String),
    #[error("invalid version {0:?}, expected <major>.<minor>")]
    InvalidVersion(String),
    #[error("{key} must be greater than zero")]
    ZeroDuration { key: &'static str },
    #[error("retry_max_ms ({max}) is below retry_initial_ms ({initial})")]
    RetryBounds { initial: u64, max: u64 },
    #[error("unknown reset policy {0:?}")]
    UnknownPolicy(String),
}

/// Failure to bring the subsystem up.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
