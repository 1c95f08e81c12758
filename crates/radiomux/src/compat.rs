//! # Compatibility Gate
//!
//! Rejects a request before it consumes a serial or a hold when the bound
//! endpoint is too old for it. A per-code override can pin the version
//! used for the check to something older than the live endpoint, which
//! selects the older behaviour for that one code; the override is also
//! handed to the transport so the codec can encode accordingly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::domain::{Domain, HalVersion};
use crate::error::RequestError;
use crate::request::{RequestCode, RequestSpec, RequestTable};

/// A request that passed the gate.
#[derive(Debug, Clone, Copy)]
pub struct Admission<'a> {
    pub spec: &'a RequestSpec,
    /// Version the codec should encode for, if overridden.
    pub version_override: Option<HalVersion>,
}

pub struct CompatibilityGate {
    table: Arc<RequestTable>,
    overrides: Mutex<HashMap<RequestCode, HalVersion>>,
}

impl CompatibilityGate {
    pub fn new(table: Arc<RequestTable>) -> Self {
        CompatibilityGate {
            table,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &RequestTable {
        &self.table
    }

    /// Checks `code` issued against `domain` with the endpoint at `live`.
    ///
    /// An unknown code, or one whose table domain differs from `domain`, is
    /// not supported. When neither an override nor a negotiated version is
    /// available the request is admitted here and the dispatcher reports
    /// the endpoint as unavailable instead.
    pub fn check(
        &self,
        code: RequestCode,
        domain: Domain,
        live: HalVersion,
    ) -> Result<Admission<'_>, RequestError> {
        let Some(spec) = self.table.get(code) else {
            debug!(request = %code, "unknown request code");
            return Err(RequestError::NotSupported);
        };
        if spec.domain != domain {
            debug!(request = %code, %domain, expected = %spec.domain, "request issued on wrong domain");
            return Err(RequestError::NotSupported);
        }

        let version_override = self.override_for(code);
        let effective = version_override.unwrap_or(live);
        if effective.is_known() && effective < spec.min_version {
            debug!(
                request = %code,
                %effective,
                min = %spec.min_version,
                "request not supported by service version"
            );
            return Err(RequestError::NotSupported);
        }

        Ok(Admission {
            spec,
            version_override,
        })
    }

    /// Pins `code` to `version`. Only lowering is allowed: an override
    /// equal to or newer than an existing one is refused.
    pub fn set_override(&self, code: RequestCode, version: HalVersion) -> bool {
        let mut overrides = self.overrides.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = overrides.get(&code) {
            if version >= *existing {
                warn!(request = %code, %version, %existing, "compat override not lowered, ignored");
                return false;
            }
        }
        overrides.insert(code, version);
        true
    }

    pub fn override_for(&self, code: RequestCode) -> Option<HalVersion> {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&code)
            .copied()
    }
}
