//! # Service Endpoints
//!
//! One slot per domain holding the live connection, its negotiated version
//! and the generation cookie. The cookie advances on every bind attempt
//! and every reset; loss notifications and responses carrying an older
//! cookie belong to a superseded connection or an abandoned attempt.
//!
//! ```text
//! Unbound ──bind──▶ Bound ──loss/reset──▶ Lost ──rebind──▶ Unbound ──▶ Bound
//!    │
//!    └──no revision offered──▶ Disabled
//! ```

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

use crate::domain::{Domain, HalVersion, Topology};
use crate::transport::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    /// Not connected; a bind is pending or in progress.
    Unbound,
    Bound,
    /// Connection torn down, reset in progress.
    Lost,
    /// Not offered on this device. Terminal until a full restart.
    Disabled,
}

/// Point-in-time view of one endpoint.
#[derive(Clone)]
pub struct EndpointSnapshot {
    pub domain: Domain,
    pub state: EndpointState,
    pub version: HalVersion,
    pub cookie: u64,
    pub connection: Option<Arc<dyn Connection>>,
}

impl EndpointSnapshot {
    pub fn is_bound(&self) -> bool {
        self.state == EndpointState::Bound && self.connection.is_some()
    }
}

impl std::fmt::Debug for EndpointSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSnapshot")
            .field("domain", &self.domain)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("cookie", &self.cookie)
            .finish()
    }
}

struct ServiceEndpoint {
    domain: Domain,
    state: EndpointState,
    version: HalVersion,
    cookie: u64,
    connection: Option<Arc<dyn Connection>>,
    disabled_reason: Option<String>,
    resets: u64,
}

impl ServiceEndpoint {
    fn new(domain: Domain) -> Self {
        ServiceEndpoint {
            domain,
            state: EndpointState::Unbound,
            version: HalVersion::UNKNOWN,
            cookie: 0,
            connection: None,
            disabled_reason: None,
            resets: 0,
        }
    }
}

/// Per-domain endpoint slots, one lock each.
pub struct EndpointTable {
    topology: Topology,
    slots: [Mutex<ServiceEndpoint>; Domain::COUNT],
}

impl EndpointTable {
    /// Creates every slot as `Unbound`; domains the topology does not serve
    /// start out `Disabled`.
    pub fn new(topology: Topology) -> Self {
        let table = EndpointTable {
            topology,
            slots: Domain::ALL.map(|d| Mutex::new(ServiceEndpoint::new(d))),
        };
        for domain in Domain::ALL {
            if !topology.serves(domain) {
                let reason = match topology {
                    Topology::Split => "superseded by split services",
                    Topology::Legacy => "served by the legacy endpoint",
                };
                table.with(domain, |ep| {
                    ep.state = EndpointState::Disabled;
                    ep.version = HalVersion::UNSUPPORTED;
                    ep.disabled_reason = Some(reason.to_string());
                });
            }
        }
        table
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    fn with<R>(&self, domain: Domain, f: impl FnOnce(&mut ServiceEndpoint) -> R) -> R {
        let mut ep = self.slots[domain.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut ep)
    }

    pub fn snapshot(&self, domain: Domain) -> EndpointSnapshot {
        self.with(domain, |ep| EndpointSnapshot {
            domain: ep.domain,
            state: ep.state,
            version: ep.version,
            cookie: ep.cookie,
            connection: ep.connection.clone(),
        })
    }

    pub fn state(&self, domain: Domain) -> EndpointState {
        self.with(domain, |ep| ep.state)
    }

    pub fn cookie(&self, domain: Domain) -> u64 {
        self.with(domain, |ep| ep.cookie)
    }

    pub fn version(&self, domain: Domain) -> HalVersion {
        self.with(domain, |ep| ep.version)
    }

    /// Number of resets this endpoint has gone through.
    pub fn resets(&self, domain: Domain) -> u64 {
        self.with(domain, |ep| ep.resets)
    }

    pub fn disabled_reason(&self, domain: Domain) -> Option<String> {
        self.with(domain, |ep| ep.disabled_reason.clone())
    }

    /// The connection if `cookie` is still the current generation.
    pub fn connection_for(&self, domain: Domain, cookie: u64) -> Option<Arc<dyn Connection>> {
        self.with(domain, |ep| {
            if ep.cookie == cookie {
                ep.connection.clone()
            } else {
                None
            }
        })
    }

    /// Domains that have their own endpoint and are not disabled.
    pub fn active_domains(&self) -> Vec<Domain> {
        Domain::ALL
            .into_iter()
            .filter(|d| self.state(*d) != EndpointState::Disabled)
            .collect()
    }

    /// Claims a fresh generation for one bind attempt and marks the
    /// endpoint `Unbound`. Returns `None` if the endpoint is disabled or
    /// already bound.
    ///
    /// Every attempt gets its own cookie, so hooks handed to an attempt
    /// that failed can never match a connection installed later.
    pub(crate) fn begin_bind(&self, domain: Domain) -> Option<u64> {
        self.with(domain, |ep| {
            if matches!(ep.state, EndpointState::Disabled | EndpointState::Bound) {
                return None;
            }
            ep.cookie += 1;
            ep.state = EndpointState::Unbound;
            Some(ep.cookie)
        })
    }

    /// Installs a freshly bound connection if `cookie` is still the
    /// attempt in progress. On success returns a connection this replaced,
    /// which the caller must close; a superseded attempt gets its own
    /// connection back.
    pub(crate) fn install(
        &self,
        domain: Domain,
        connection: Arc<dyn Connection>,
        version: HalVersion,
        cookie: u64,
    ) -> Result<Option<Arc<dyn Connection>>, Arc<dyn Connection>> {
        self.with(domain, |ep| {
            if ep.cookie != cookie || ep.state != EndpointState::Unbound {
                return Err(connection);
            }
            ep.state = EndpointState::Bound;
            ep.version = version;
            Ok(ep.connection.replace(connection))
        })
    }

    /// Starts a reset: advances the cookie and detaches the connection.
    /// Returns `None` for a disabled endpoint, which is left untouched.
    pub(crate) fn begin_reset(&self, domain: Domain) -> Option<Option<Arc<dyn Connection>>> {
        self.with(domain, |ep| {
            if ep.state == EndpointState::Disabled {
                return None;
            }
            ep.cookie += 1;
            ep.resets += 1;
            ep.state = EndpointState::Lost;
            Some(ep.connection.take())
        })
    }

    /// Takes the endpoint out of service for this boot.
    pub(crate) fn disable(&self, domain: Domain, reason: &str) -> Option<Arc<dyn Connection>> {
        self.with(domain, |ep| Self::disable_slot(ep, reason))
    }

    /// Disables the endpoint only if the bind attempt `cookie` is still
    /// the one in progress. Returns `None` if it was superseded.
    pub(crate) fn disable_attempt(
        &self,
        domain: Domain,
        cookie: u64,
        reason: &str,
    ) -> Option<Option<Arc<dyn Connection>>> {
        self.with(domain, |ep| {
            if ep.cookie != cookie || ep.state != EndpointState::Unbound {
                return None;
            }
            Some(Self::disable_slot(ep, reason))
        })
    }

    fn disable_slot(ep: &mut ServiceEndpoint, reason: &str) -> Option<Arc<dyn Connection>> {
        info!(domain = %ep.domain, reason, "service endpoint disabled");
        ep.state = EndpointState::Disabled;
        ep.version = HalVersion::UNSUPPORTED;
        ep.disabled_reason = Some(reason.to_string());
        ep.cookie += 1;
        ep.connection.take()
    }

    /// Returns a served endpoint to `Unbound` with no connection, keeping
    /// a disabled one disabled. Used by restart and shutdown.
    pub(crate) fn unbind(&self, domain: Domain) -> Option<Arc<dyn Connection>> {
        self.with(domain, |ep| {
            ep.cookie += 1;
            if ep.state != EndpointState::Disabled {
                ep.state = EndpointState::Unbound;
                ep.version = HalVersion::UNKNOWN;
            }
            ep.connection.take()
        })
    }

    /// Clears a disable that was not imposed by the topology.
    pub(crate) fn reenable(&self, domain: Domain) {
        if !self.topology.serves(domain) {
            return;
        }
        self.with(domain, |ep| {
            if ep.state == EndpointState::Disabled {
                ep.state = EndpointState::Unbound;
                ep.version = HalVersion::UNKNOWN;
                ep.disabled_reason = None;
            }
        });
    }
}
