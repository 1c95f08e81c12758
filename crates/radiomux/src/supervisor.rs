//! # Endpoint Supervisor
//!
//! Binds every served domain, watches for connection loss and runs the
//! reset protocol:
//!
//! 1. advance the generation cookie so older loss signals become stale,
//! 2. detach and close the connection,
//! 3. drain the domain's pending requests with `ServiceUnavailable`,
//! 4. rebind.
//!
//! Which domains go down together is decided by [`ResetPolicy`]. Every
//! bind attempt claims its own generation, so concurrent binds and resets
//! settle on whichever claimed last without a lock held across the
//! locator call. Loss signals, send failures and explicit reset requests
//! arrive as [`SupervisorEvent`]s on a single channel consumed by the
//! supervisor thread, which also runs bind retries with exponential
//! backoff.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::domain::{Domain, HalVersion, Topology};
use crate::endpoint::{EndpointState, EndpointTable};
use crate::error::{BindError, ConfigError};
use crate::observer::{EventHub, RadioPowerState};
use crate::telemetry::{LossReason, TelemetrySink};
use crate::transport::{Connection, LinkHooks, Origin, ServiceLocator};

// ─── Policy & config ────────────────────────────────────────────────────────

/// Which endpoints are reset when one non-legacy endpoint is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Only the lost domain.
    SingleDomain,
    /// Every non-legacy domain, since one remote process usually backs
    /// them all.
    #[default]
    AllNonLegacy,
}

impl fmt::Display for ResetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetPolicy::SingleDomain => "single-domain",
            ResetPolicy::AllNonLegacy => "all-non-legacy",
        })
    }
}

impl FromStr for ResetPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single-domain" | "single" => Ok(ResetPolicy::SingleDomain),
            "all-non-legacy" | "all" => Ok(ResetPolicy::AllNonLegacy),
            _ => Err(ConfigError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Configuration for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub reset_policy: ResetPolicy,
    /// First bind retry delay after a transient failure.
    pub retry_initial: Duration,
    /// Cap for the doubling retry delay.
    pub retry_max: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            reset_policy: ResetPolicy::AllNonLegacy,
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Events consumed by the supervisor thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The remote side of a connection died.
    ConnectionLost { domain: Domain, cookie: u64 },
    /// A send or acknowledgment failed at the transport level.
    SendFailed { domain: Domain, cookie: u64 },
    /// Explicit reset request.
    Reset { domain: Domain },
    Shutdown,
}

/// Result of one bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound(HalVersion),
    /// Transient failure; another attempt is scheduled after the delay.
    Retrying(Duration),
    Disabled,
    /// A reset, restart or newer bind overtook this attempt.
    Superseded,
}

struct Retry {
    due: Instant,
    backoff: Duration,
}

#[derive(Default)]
struct OpsState {
    retries: HashMap<Domain, Retry>,
    stopped: bool,
}

// ─── Supervisor ─────────────────────────────────────────────────────────────

/// Owns bind, reset and restart for every endpoint.
///
/// The operations lock only guards state transitions: retry bookkeeping,
/// the stopped flag and the set of endpoints a reset takes down. Locator
/// calls, connection closes and caller continuations all run after it is
/// released, so a continuation may itself reset or restart.
pub struct EndpointSupervisor {
    endpoints: Arc<EndpointTable>,
    locator: Arc<dyn ServiceLocator>,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    telemetry: Arc<dyn TelemetrySink>,
    config: SupervisorConfig,
    events: Sender<SupervisorEvent>,
    ops: Mutex<OpsState>,
}

impl EndpointSupervisor {
    pub fn new(
        endpoints: Arc<EndpointTable>,
        locator: Arc<dyn ServiceLocator>,
        dispatcher: Arc<Dispatcher>,
        hub: Arc<EventHub>,
        telemetry: Arc<dyn TelemetrySink>,
        config: SupervisorConfig,
        events: Sender<SupervisorEvent>,
    ) -> Self {
        EndpointSupervisor {
            endpoints,
            locator,
            dispatcher,
            hub,
            telemetry,
            config,
            events,
            ops: Mutex::new(OpsState::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn policy(&self) -> ResetPolicy {
        self.config.reset_policy
    }

    fn lock_ops(&self) -> MutexGuard<'_, OpsState> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues an explicit reset for the supervisor thread.
    pub fn request_reset(&self, domain: Domain) {
        let _ = self.events.send(SupervisorEvent::Reset { domain });
    }

    /// Binds one domain, trying its most capable revision first. An
    /// endpoint that is already bound is left alone.
    pub fn bind(&self, domain: Domain) -> BindOutcome {
        if self.lock_ops().stopped {
            return BindOutcome::Disabled;
        }
        let Some(mut cookie) = self.endpoints.begin_bind(domain) else {
            self.lock_ops().retries.remove(&domain);
            return self.settled(domain);
        };
        if !self.locator.is_declared(domain) {
            return self.disable_attempt(domain, cookie, "not declared by the device");
        }

        let mut transient = None;
        for (rung, &version) in domain.version_ladder().iter().enumerate() {
            if rung > 0 {
                match self.endpoints.begin_bind(domain) {
                    Some(next) => cookie = next,
                    None => return BindOutcome::Superseded,
                }
            }
            let origin = Origin { domain, cookie };
            let hooks = LinkHooks::new(origin, Arc::downgrade(&self.dispatcher), self.events.clone());
            match self.locator.connect(domain, version, hooks) {
                Ok(connection) => {
                    return match self.endpoints.install(domain, connection, version, cookie) {
                        Ok(replaced) => {
                            if let Some(old) = replaced {
                                old.close();
                            }
                            self.lock_ops().retries.remove(&domain);
                            info!(%domain, %version, cookie, "service endpoint bound");
                            BindOutcome::Bound(version)
                        }
                        Err(connection) => {
                            connection.close();
                            debug!(%domain, %version, cookie, "bind superseded, connection discarded");
                            BindOutcome::Superseded
                        }
                    };
                }
                Err(BindError::NotFound) => {
                    debug!(%domain, %version, "revision not offered");
                }
                Err(BindError::Unavailable(reason)) => {
                    transient = Some(reason);
                    break;
                }
            }
        }

        match transient {
            Some(reason) => self.schedule_retry(domain, cookie, &reason),
            None => self.disable_attempt(domain, cookie, "no supported revision"),
        }
    }

    /// Binds every served, non-disabled domain.
    pub fn bind_all(&self) -> Vec<(Domain, BindOutcome)> {
        self.endpoints
            .active_domains()
            .into_iter()
            .map(|d| (d, self.bind(d)))
            .collect()
    }

    fn settled(&self, domain: Domain) -> BindOutcome {
        let snap = self.endpoints.snapshot(domain);
        match snap.state {
            EndpointState::Bound => BindOutcome::Bound(snap.version),
            EndpointState::Disabled => BindOutcome::Disabled,
            _ => BindOutcome::Superseded,
        }
    }

    fn schedule_retry(&self, domain: Domain, cookie: u64, reason: &str) -> BindOutcome {
        let mut ops = self.lock_ops();
        if ops.stopped || self.endpoints.cookie(domain) != cookie {
            return BindOutcome::Superseded;
        }
        let backoff = ops
            .retries
            .get(&domain)
            .map(|r| (r.backoff * 2).min(self.config.retry_max))
            .unwrap_or(self.config.retry_initial);
        ops.retries.insert(
            domain,
            Retry {
                due: Instant::now() + backoff,
                backoff,
            },
        );
        warn!(
            %domain,
            %reason,
            backoff_ms = backoff.as_millis() as u64,
            "bind failed, retrying"
        );
        BindOutcome::Retrying(backoff)
    }

    fn disable_attempt(&self, domain: Domain, cookie: u64, reason: &str) -> BindOutcome {
        let Some(old) = self.endpoints.disable_attempt(domain, cookie, reason) else {
            return BindOutcome::Superseded;
        };
        self.lock_ops().retries.remove(&domain);
        if let Some(old) = old {
            old.close();
        }
        self.dispatcher.drain_domain(domain);
        BindOutcome::Disabled
    }

    /// Handles a loss signal. Returns false if `cookie` is stale, in which
    /// case nothing changes.
    pub fn on_connection_lost(&self, domain: Domain, cookie: u64) -> bool {
        self.reset_if_current(domain, cookie, LossReason::ConnectionLost)
    }

    /// Handles a transport-level send failure, like a loss signal.
    pub fn on_send_failed(&self, domain: Domain, cookie: u64) -> bool {
        self.reset_if_current(domain, cookie, LossReason::SendFailed)
    }

    fn reset_if_current(&self, domain: Domain, cookie: u64, reason: LossReason) -> bool {
        let detached = {
            let mut ops = self.lock_ops();
            let snap = self.endpoints.snapshot(domain);
            if snap.cookie != cookie || snap.state != EndpointState::Bound {
                debug!(
                    %domain,
                    cookie,
                    current = snap.cookie,
                    reason = reason.as_str(),
                    "stale loss notification ignored"
                );
                return false;
            }
            info!(%domain, cookie, reason = reason.as_str(), "service endpoint lost");
            self.detach_locked(&mut ops, domain)
        };
        self.complete_reset(domain, reason, detached);
        true
    }

    /// Resets `domain` (and its siblings, per policy) unconditionally.
    /// Returns the domains that were reset.
    ///
    /// Drained callers are completed on the calling thread before the
    /// rebind.
    pub fn reset(&self, domain: Domain, reason: LossReason) -> Vec<Domain> {
        let detached = {
            let mut ops = self.lock_ops();
            self.detach_locked(&mut ops, domain)
        };
        self.complete_reset(domain, reason, detached)
    }

    fn reset_targets(&self, domain: Domain) -> Vec<Domain> {
        let domain = self.endpoints.topology().route(domain);
        if domain.is_legacy() || self.config.reset_policy == ResetPolicy::SingleDomain {
            return vec![domain];
        }
        Domain::SPLIT.to_vec()
    }

    /// Advances the cookie of every reset target and takes its connection.
    fn detach_locked(
        &self,
        ops: &mut OpsState,
        domain: Domain,
    ) -> Vec<(Domain, Option<Arc<dyn Connection>>)> {
        let mut detached = Vec::new();
        for target in self.reset_targets(domain) {
            if let Some(old) = self.endpoints.begin_reset(target) {
                ops.retries.remove(&target);
                detached.push((target, old));
            }
        }
        detached
    }

    fn complete_reset(
        &self,
        domain: Domain,
        reason: LossReason,
        detached: Vec<(Domain, Option<Arc<dyn Connection>>)>,
    ) -> Vec<Domain> {
        let primary = self.endpoints.topology().route(domain);
        let mut reset = Vec::with_capacity(detached.len());
        for (target, old) in detached {
            if let Some(connection) = old {
                connection.close();
            }
            let why = if target == primary { reason } else { LossReason::Sibling };
            if let Err(e) = self.telemetry.record_loss(target, why) {
                debug!(error = %e, "loss telemetry dropped");
            }
            reset.push(target);
        }

        for target in &reset {
            let drained = self.dispatcher.drain_domain(*target);
            if drained > 0 {
                info!(domain = %target, drained, "pending requests failed by reset");
            }
        }

        if reset.contains(&Domain::Radio) {
            self.hub.set_radio_state(RadioPowerState::Unavailable, true);
        }

        for target in &reset {
            self.bind(*target);
        }
        reset
    }

    /// Full restart: every endpoint is torn down, every pending request
    /// failed, serials restart from 1, and served domains not listed in
    /// `keep_disabled` are rebound.
    pub fn restart(&self, keep_disabled: &[Domain]) {
        let mut detached = Vec::new();
        {
            let mut ops = self.lock_ops();
            if ops.stopped {
                return;
            }
            ops.retries.clear();
            for domain in Domain::ALL {
                let was_active = self.endpoints.state(domain) != EndpointState::Disabled;
                let old = self.endpoints.unbind(domain);
                detached.push((domain, old, was_active));
            }
            // Numbering restarts before anything is drained, so a request
            // still being issued against the old epoch is recognisable.
            self.dispatcher.reset_serials();
            for domain in Domain::ALL {
                if !keep_disabled.contains(&domain) {
                    self.endpoints.reenable(domain);
                }
            }
        }

        for (domain, old, was_active) in detached {
            if let Some(connection) = old {
                connection.close();
            }
            if was_active {
                if let Err(e) = self.telemetry.record_loss(domain, LossReason::Restart) {
                    debug!(error = %e, "loss telemetry dropped");
                }
            }
        }

        let drained = self.dispatcher.drain_all();
        info!(drained, "subsystem restart");

        if self.endpoints.topology() == Topology::Legacy {
            self.hub.set_radio_state(RadioPowerState::Unavailable, true);
        }
        self.bind_all();
    }

    /// Closes every connection and stops further binds. Idempotent.
    pub fn shutdown(&self) {
        let mut detached = Vec::new();
        {
            let mut ops = self.lock_ops();
            if ops.stopped {
                return;
            }
            ops.stopped = true;
            ops.retries.clear();
            for domain in Domain::ALL {
                detached.extend(self.endpoints.unbind(domain));
            }
        }
        for connection in detached {
            connection.close();
        }
    }

    /// Delay until the earliest scheduled bind retry.
    pub fn next_retry_in(&self) -> Option<Duration> {
        let ops = self.lock_ops();
        let now = Instant::now();
        ops.retries
            .values()
            .map(|r| r.due.saturating_duration_since(now))
            .min()
    }

    /// Runs every bind retry that is due.
    pub fn run_due_retries(&self) {
        let due: Vec<Domain> = {
            let ops = self.lock_ops();
            let now = Instant::now();
            ops.retries
                .iter()
                .filter(|(_, r)| r.due <= now)
                .map(|(d, _)| *d)
                .collect()
        };
        for domain in due {
            debug!(%domain, "retrying bind");
            self.bind(domain);
        }
    }

    /// Processes one event. Returns false on shutdown.
    pub fn handle(&self, event: SupervisorEvent) -> bool {
        match event {
            SupervisorEvent::ConnectionLost { domain, cookie } => {
                self.on_connection_lost(domain, cookie);
            }
            SupervisorEvent::SendFailed { domain, cookie } => {
                self.on_send_failed(domain, cookie);
            }
            SupervisorEvent::Reset { domain } => {
                self.reset(domain, LossReason::Requested);
            }
            SupervisorEvent::Shutdown => return false,
        }
        true
    }

    /// Spawns the supervisor thread consuming `events`.
    pub fn spawn(
        self: Arc<Self>,
        events: Receiver<SupervisorEvent>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("radiomux-supervisor".into())
            .spawn(move || supervisor_loop(self, events))
    }
}

fn supervisor_loop(supervisor: Arc<EndpointSupervisor>, events: Receiver<SupervisorEvent>) {
    loop {
        let event = match supervisor.next_retry_in() {
            Some(wait) => match events.recv_timeout(wait) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match events.recv() {
                Ok(event) => Some(event),
                Err(_) => break,
            },
        };

        if let Some(event) = event {
            if !supervisor.handle(event) {
                break;
            }
        }
        supervisor.run_due_retries();
    }
    debug!("supervisor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_config_names() {
        assert_eq!("single-domain".parse::<ResetPolicy>().unwrap(), ResetPolicy::SingleDomain);
        assert_eq!("ALL-NON-LEGACY".parse::<ResetPolicy>().unwrap(), ResetPolicy::AllNonLegacy);
        assert!("sometimes".parse::<ResetPolicy>().is_err());
        assert_eq!(ResetPolicy::default().to_string(), "all-non-legacy");
    }

    #[test]
    fn default_config_backoff_bounds() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.retry_initial, Duration::from_secs(1));
        assert_eq!(cfg.retry_max, Duration::from_secs(30));
        assert_eq!(cfg.reset_policy, ResetPolicy::AllNonLegacy);
    }
}
