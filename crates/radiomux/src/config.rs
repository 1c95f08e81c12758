//! TOML configuration.
//!
//! Parsed into a [`MuxConfigInput`] where every key is optional, then
//! resolved and validated into a [`MuxConfig`]. An empty document gives
//! the defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::{Domain, HalVersion};
use crate::error::ConfigError;
use crate::hold::HoldTimeouts;
use crate::request::RequestCode;
use crate::supervisor::{ResetPolicy, SupervisorConfig};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MuxConfigInput {
    pub version: u32,
    pub holds: HoldsInput,
    pub dispatch: DispatchInput,
    pub supervisor: SupervisorInput,
    pub disabled_domains: Vec<String>,
    pub compat_overrides: Vec<CompatOverrideInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HoldsInput {
    pub work_timeout_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchInput {
    pub blocking_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorInput {
    pub reset_policy: Option<String>,
    pub retry_initial_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompatOverrideInput {
    pub request: u32,
    pub version: String,
}

/// Forces the compatibility check for one code to an older version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatOverride {
    pub request: RequestCode,
    pub version: HalVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub version: u32,
    pub holds: HoldTimeouts,
    /// How long a blocking call waits before its default is delivered.
    pub blocking_timeout: Duration,
    pub supervisor: SupervisorConfig,
    pub disabled_domains: Vec<Domain>,
    pub compat_overrides: Vec<CompatOverride>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            version: CONFIG_VERSION,
            holds: HoldTimeouts::default(),
            blocking_timeout: Duration::from_millis(2_000),
            supervisor: SupervisorConfig::default(),
            disabled_domains: Vec::new(),
            compat_overrides: Vec::new(),
        }
    }
}

fn millis(value: Option<u64>, default: Duration, key: &'static str) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::ZeroDuration { key }),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

impl MuxConfigInput {
    pub fn resolve(self) -> Result<MuxConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = MuxConfig::default();
        let holds = HoldTimeouts {
            work: millis(self.holds.work_timeout_ms, defaults.holds.work, "holds.work_timeout_ms")?,
            ack: millis(self.holds.ack_timeout_ms, defaults.holds.ack, "holds.ack_timeout_ms")?,
        };
        let blocking_timeout = millis(
            self.dispatch.blocking_timeout_ms,
            defaults.blocking_timeout,
            "dispatch.blocking_timeout_ms",
        )?;

        let reset_policy = match self.supervisor.reset_policy.as_deref() {
            Some(name) => ResetPolicy::from_str(name)?,
            None => defaults.supervisor.reset_policy,
        };
        let retry_initial = millis(
            self.supervisor.retry_initial_ms,
            defaults.supervisor.retry_initial,
            "supervisor.retry_initial_ms",
        )?;
        let retry_max = millis(
            self.supervisor.retry_max_ms,
            defaults.supervisor.retry_max,
            "supervisor.retry_max_ms",
        )?;
        if retry_max < retry_initial {
            return Err(ConfigError::RetryBounds {
                initial: retry_initial.as_millis() as u64,
                max: retry_max.as_millis() as u64,
            });
        }

        let mut disabled_domains = Vec::new();
        for name in &self.disabled_domains {
            let domain = Domain::from_str(name)?;
            if !disabled_domains.contains(&domain) {
                disabled_domains.push(domain);
            }
        }

        let compat_overrides = self
            .compat_overrides
            .iter()
            .map(|o| {
                Ok(CompatOverride {
                    request: RequestCode(o.request),
                    version: HalVersion::from_str(&o.version)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(MuxConfig {
            version,
            holds,
            blocking_timeout,
            supervisor: SupervisorConfig {
                reset_policy,
                retry_initial,
                retry_max,
            },
            disabled_domains,
            compat_overrides,
        })
    }
}

impl MuxConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(MuxConfig::default());
        }
        let parsed: MuxConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }
}
