//! # Service Domains
//!
//! The remote modem exposes its functionality as independently-versioned
//! service domains. `Radio` is the legacy monolithic interface; once any
//! of the other seven are declared by the device, `Radio` is superseded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── Domain ─────────────────────────────────────────────────────────────────

/// One remote service category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Legacy monolithic radio interface.
    Radio,
    Data,
    Messaging,
    Modem,
    Network,
    Sim,
    Voice,
    Ims,
}

impl Domain {
    /// Every domain, in index order.
    pub const ALL: [Domain; 8] = [
        Domain::Radio,
        Domain::Data,
        Domain::Messaging,
        Domain::Modem,
        Domain::Network,
        Domain::Sim,
        Domain::Voice,
        Domain::Ims,
    ];

    /// Every non-legacy domain.
    pub const SPLIT: [Domain; 7] = [
        Domain::Data,
        Domain::Messaging,
        Domain::Modem,
        Domain::Network,
        Domain::Sim,
        Domain::Voice,
        Domain::Ims,
    ];

    pub const COUNT: usize = 8;

    /// Dense index, used for per-domain tables.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_legacy(self) -> bool {
        self == Domain::Radio
    }

    pub fn name(self) -> &'static str {
        match self {
            Domain::Radio => "radio",
            Domain::Data => "data",
            Domain::Messaging => "messaging",
            Domain::Modem => "modem",
            Domain::Network => "network",
            Domain::Sim => "sim",
            Domain::Voice => "voice",
            Domain::Ims => "ims",
        }
    }

    /// Protocol revisions tried by `bind`, most capable first.
    pub fn version_ladder(self) -> &'static [HalVersion] {
        const LEGACY: [HalVersion; 3] = [HalVersion::V1_6, HalVersion::V1_5, HalVersion::V1_4];
        const SPLIT: [HalVersion; 3] = [HalVersion::V2_2, HalVersion::V2_1, HalVersion::V2_0];
        if self.is_legacy() {
            &LEGACY
        } else {
            &SPLIT
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Domain {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Domain::ALL
            .into_iter()
            .find(|d| d.name() == needle)
            .ok_or_else(|| ConfigError::UnknownDomain(s.to_string()))
    }
}

// ─── HalVersion ─────────────────────────────────────────────────────────────

/// Negotiated protocol revision of a service endpoint.
///
/// Ordering is lexicographic on `(major, minor)`, so the two sentinels
/// sort below every real revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HalVersion {
    pub major: i16,
    pub minor: i16,
}

impl HalVersion {
    /// The domain is not offered on this device.
    pub const UNSUPPORTED: HalVersion = HalVersion::new(-2, -2);
    /// Not negotiated yet.
    pub const UNKNOWN: HalVersion = HalVersion::new(-1, -1);
    pub const V1_4: HalVersion = HalVersion::new(1, 4);
    pub const V1_5: HalVersion = HalVersion::new(1, 5);
    pub const V1_6: HalVersion = HalVersion::new(1, 6);
    pub const V2_0: HalVersion = HalVersion::new(2, 0);
    pub const V2_1: HalVersion = HalVersion::new(2, 1);
    pub const V2_2: HalVersion = HalVersion::new(2, 2);

    pub const fn new(major: i16, minor: i16) -> Self {
        HalVersion { major, minor }
    }

    /// Whether this is a real, negotiated revision.
    pub fn is_known(self) -> bool {
        self.major >= 0
    }
}

impl fmt::Display for HalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HalVersion::UNSUPPORTED => f.write_str("unsupported"),
            HalVersion::UNKNOWN => f.write_str("unknown"),
            HalVersion { major, minor } => write!(f, "{major}.{minor}"),
        }
    }
}

impl FromStr for HalVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(bad)?;
        let major: i16 = major.parse().map_err(|_| bad())?;
        let minor: i16 = minor.parse().map_err(|_| bad())?;
        if major < 0 || minor < 0 {
            return Err(bad());
        }
        Ok(HalVersion::new(major, minor))
    }
}

// ─── Topology ───────────────────────────────────────────────────────────────

/// How requests map onto endpoints, decided once when the subsystem starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Per-domain endpoints; the legacy `Radio` endpoint is superseded.
    Split,
    /// Only the legacy endpoint exists and carries every domain.
    Legacy,
}

impl Topology {
    /// Endpoint that actually carries requests for `domain`.
    pub fn route(self, domain: Domain) -> Domain {
        match self {
            Topology::Split => domain,
            Topology::Legacy => Domain::Radio,
        }
    }

    /// Whether `domain` has its own endpoint under this topology.
    pub fn serves(self, domain: Domain) -> bool {
        match self {
            Topology::Split => !domain.is_legacy(),
            Topology::Legacy => domain.is_legacy(),
        }
    }
}
