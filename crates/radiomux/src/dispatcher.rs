//! # Dispatcher
//!
//! Callers issue requests here; transports report responses, request
//! acks and indications here. Correlation is by serial only, so answers
//! may arrive in any order.
//!
//! Every request holds exactly one entry in the pending registry from
//! registration until a terminal event, and removal from the registry is
//! the only gate to completion:
//!
//! | terminal event            | outcome                               |
//! |---------------------------|---------------------------------------|
//! | solicited response        | payload, or `Radio(status)`           |
//! | domain reset / shutdown   | `ServiceUnavailable`                  |
//! | codec rejected the send   | `Radio(SYSTEM_ERR)`                   |
//! | blocking deadline         | the code's neutral default payload    |
//!
//! A transport-level send failure does not complete the request directly;
//! it is reported to the supervisor, whose reset drains the whole domain.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::compat::CompatibilityGate;
use crate::domain::Domain;
use crate::endpoint::{EndpointState, EndpointTable};
use crate::error::{RadioError, RegistryError, RequestError, SendError};
use crate::hold::{AttributionTag, HoldController, HoldTimeouts, PowerResource};
use crate::observer::{EventHub, Indication, RadioPowerState};
use crate::registry::PendingRegistry;
use crate::request::{
    Completion, EventCode, IndicationKind, Outcome, RequestCode, RequestRecord, RequestTable,
    Response, ResponseInfo, ResponseKind,
};
use crate::serial::{Serial, SerialAllocator};
use crate::supervisor::SupervisorEvent;
use crate::telemetry::TelemetrySink;
use crate::timer::{Scheduler, TimerEvent};
use crate::transport::{OutboundRequest, Origin};

/// Everything a [`Dispatcher`] is wired to.
pub struct DispatcherParts {
    pub table: Arc<RequestTable>,
    pub endpoints: Arc<EndpointTable>,
    pub hub: Arc<EventHub>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub power: Arc<dyn PowerResource>,
    pub scheduler: Arc<dyn Scheduler>,
    /// Where transport-level send failures are reported.
    pub supervisor: Sender<SupervisorEvent>,
    pub hold_timeouts: HoldTimeouts,
    pub blocking_timeout: Duration,
}

pub struct Dispatcher {
    gate: CompatibilityGate,
    registry: PendingRegistry,
    holds: HoldController,
    serials: SerialAllocator,
    endpoints: Arc<EndpointTable>,
    hub: Arc<EventHub>,
    telemetry: Arc<dyn TelemetrySink>,
    scheduler: Arc<dyn Scheduler>,
    supervisor: Sender<SupervisorEvent>,
    blocking_timeout: Duration,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Dispatcher {
            gate: CompatibilityGate::new(parts.table),
            registry: PendingRegistry::new(),
            holds: HoldController::new(parts.power, parts.scheduler.clone(), parts.hold_timeouts),
            serials: SerialAllocator::new(),
            endpoints: parts.endpoints,
            hub: parts.hub,
            telemetry: parts.telemetry,
            scheduler: parts.scheduler,
            supervisor: parts.supervisor,
            blocking_timeout: parts.blocking_timeout,
        }
    }

    pub fn gate(&self) -> &CompatibilityGate {
        &self.gate
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn holds(&self) -> &HoldController {
        &self.holds
    }

    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn blocking_timeout(&self) -> Duration {
        self.blocking_timeout
    }

    // ─── Issue ──────────────────────────────────────────────────────────

    /// Issues `code` against `domain`. Never blocks; `completion` runs
    /// exactly once, possibly before this returns.
    pub fn issue(
        &self,
        domain: Domain,
        code: RequestCode,
        args: Bytes,
        tag: AttributionTag,
        completion: Completion,
    ) {
        let route = self.endpoints.topology().route(domain);
        let endpoint = self.endpoints.snapshot(route);

        let admission = match self.gate.check(code, domain, endpoint.version) {
            Ok(admission) => admission,
            Err(e) => {
                completion(Err(e));
                return;
            }
        };
        let blocking = admission.spec.is_blocking();
        let version_override = admission.version_override;

        let connection = match endpoint.connection {
            Some(connection) if endpoint.state == EndpointState::Bound => connection,
            _ => {
                debug!(%domain, request = %code, state = ?endpoint.state, "endpoint not bound");
                completion(Err(RequestError::ServiceUnavailable));
                return;
            }
        };

        let (serial, epoch) = self.serials.allocate();
        let mut record = RequestRecord::new(serial, code, route, tag, endpoint.cookie, completion);
        record.epoch = epoch;
        record.hold = Some(self.holds.acquire_work(&record.tag));

        match self.registry.insert(record) {
            Ok(None) => {}
            Ok(Some(stale)) => {
                // Left over from before a restart; its issuer will see the
                // epoch change and not touch the newer record.
                self.finish(stale, Err(RequestError::ServiceUnavailable));
            }
            Err((RegistryError::Superseded(_), record)) => {
                debug!(%serial, request = %code, "issue straddled a restart");
                self.finish(record, Err(RequestError::ServiceUnavailable));
                return;
            }
            Err((err, record)) => {
                self.finish(record, Err(RequestError::InternalDuplicate(serial)));
                if cfg!(debug_assertions) {
                    panic!("{err}");
                }
                return;
            }
        }

        // A reset that advanced the cookie, or a restart that advanced the
        // epoch, before our insert may have drained without seeing us.
        if self.endpoints.cookie(route) != endpoint.cookie || self.serials.epoch() != epoch {
            if let Some(record) = self.registry.remove_if(serial, |r| r.epoch == epoch) {
                self.finish(record, Err(RequestError::ServiceUnavailable));
            }
            return;
        }

        debug!(%serial, domain = %route, request = %code, "request issued");
        if blocking {
            self.scheduler.schedule(
                self.blocking_timeout,
                TimerEvent::BlockingDeadline { serial, epoch },
            );
        }

        let request = OutboundRequest {
            serial,
            code,
            args,
            version_override,
        };
        match connection.send(&request) {
            Ok(()) => {}
            Err(SendError::Rejected(reason)) => {
                warn!(%serial, request = %code, %reason, "request rejected by codec");
                if let Some(record) = self.registry.remove_if(serial, |r| r.epoch == epoch) {
                    self.finish(record, Err(RequestError::Radio(RadioError::SYSTEM_ERR)));
                }
            }
            Err(SendError::Transport(reason)) => {
                warn!(%serial, domain = %route, %reason, "send failed, resetting endpoint");
                self.report_send_failure(Origin {
                    domain: route,
                    cookie: endpoint.cookie,
                });
            }
        }
    }

    /// Typed wrapper around [`issue`](Self::issue).
    pub fn call<C, F>(&self, command: &C, tag: AttributionTag, on_done: F)
    where
        C: Command,
        F: FnOnce(Result<C::Output, RequestError>) + Send + 'static,
    {
        self.issue(
            C::DOMAIN,
            C::CODE,
            command.encode(),
            tag,
            Box::new(move |outcome| on_done(outcome.and_then(|r| C::decode(&r)))),
        );
    }

    // ─── Responses ──────────────────────────────────────────────────────

    /// A solicited response reported by the connection `origin`.
    pub fn on_solicited_response(&self, origin: Origin, info: ResponseInfo, payload: Bytes) {
        if info.kind == ResponseKind::SolicitedAck {
            self.on_request_ack(origin, info.serial);
            return;
        }

        let Some(record) = self
            .registry
            .remove_if(info.serial, |r| Self::sent_on(r, origin))
        else {
            warn!(
                serial = %info.serial,
                domain = %origin.domain,
                cookie = origin.cookie,
                "unexpected solicited response dropped"
            );
            return;
        };

        if info.kind == ResponseKind::SolicitedAckExpected {
            self.send_ack(origin);
        }

        if let Err(e) = self
            .telemetry
            .record_latency(record.code, record.issued_at.elapsed())
        {
            debug!(error = %e, "latency telemetry dropped");
        }

        let outcome = if info.error.is_none() {
            Ok(Response {
                serial: record.serial,
                code: record.code,
                payload,
                synthesized: false,
            })
        } else {
            Err(RequestError::Radio(info.error))
        };
        debug!(serial = %record.serial, request = %record.code, error = %info.error, "response");
        self.finish(record, outcome);
    }

    /// The remote confirmed receipt of `serial`; its work hold is released
    /// now while the record waits for the real response.
    pub fn on_request_ack(&self, origin: Origin, serial: Serial) {
        match self.registry.take_hold(serial, |r| Self::sent_on(r, origin)) {
            Some(ticket) => {
                self.holds.release_work(ticket);
                debug!(%serial, "request acknowledged");
            }
            None => debug!(%serial, "ack for unknown or already released request"),
        }
    }

    /// A remote-initiated indication.
    pub fn on_unsolicited(&self, origin: Origin, kind: IndicationKind, code: EventCode, payload: Bytes) {
        if self.endpoints.cookie(origin.domain) != origin.cookie {
            debug!(domain = %origin.domain, event = %code, "indication from superseded connection dropped");
            return;
        }
        if kind == IndicationKind::UnsolicitedAckExpected {
            self.send_ack(origin);
        }
        if code == EventCode::RADIO_STATE_CHANGED {
            if let Some(state) = payload.first().copied().and_then(RadioPowerState::from_wire) {
                self.hub.set_radio_state(state, false);
            }
        }
        self.hub.publish(Indication {
            domain: origin.domain,
            code,
            payload,
        });
    }

    fn sent_on(record: &RequestRecord, origin: Origin) -> bool {
        record.domain == origin.domain && record.cookie == origin.cookie
    }

    fn send_ack(&self, origin: Origin) {
        self.holds.acquire_ack();
        let Some(connection) = self.endpoints.connection_for(origin.domain, origin.cookie) else {
            debug!(domain = %origin.domain, "ack target superseded");
            return;
        };
        if let Err(e) = connection.send_ack() {
            warn!(domain = %origin.domain, error = %e, "ack send failed, resetting endpoint");
            self.report_send_failure(origin);
        }
    }

    fn report_send_failure(&self, origin: Origin) {
        let _ = self.supervisor.send(SupervisorEvent::SendFailed {
            domain: origin.domain,
            cookie: origin.cookie,
        });
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Routes a fired timer event.
    pub fn on_timer(&self, event: TimerEvent) {
        match event {
            TimerEvent::WorkHoldExpired { seq } => {
                self.holds.on_work_timeout(seq);
            }
            TimerEvent::AckHoldExpired { seq } => {
                self.holds.on_ack_timeout(seq);
            }
            TimerEvent::BlockingDeadline { serial, epoch } => {
                self.on_blocking_timeout(serial, epoch);
            }
        }
    }

    /// Answers a blocking call that is still pending with its default.
    /// Returns false if it already completed, `epoch` predates a restart,
    /// or `serial` is not a blocking call.
    pub fn on_blocking_timeout(&self, serial: Serial, epoch: u64) -> bool {
        if epoch != self.serials.epoch() {
            return false;
        }
        let table = self.gate.table();
        let Some(record) = self.registry.remove_if(serial, |r| {
            r.epoch == epoch && table.get(r.code).is_some_and(|spec| spec.is_blocking())
        }) else {
            return false;
        };
        let payload = table
            .get(record.code)
            .and_then(|spec| spec.blocking_default.clone())
            .unwrap_or_default();
        if let Err(e) = self.telemetry.record_timeout(record.code) {
            debug!(error = %e, "timeout telemetry dropped");
        }
        info!(%serial, request = %record.code, "blocking call timed out, answering with default");
        let response = Response {
            serial,
            code: record.code,
            payload,
            synthesized: true,
        };
        self.finish(record, Ok(response));
        true
    }

    // ─── Draining ───────────────────────────────────────────────────────

    /// Fails every request sent on `domain` with `ServiceUnavailable`.
    pub fn drain_domain(&self, domain: Domain) -> usize {
        let drained = self.registry.drain(domain);
        let n = drained.len();
        for record in drained {
            self.finish(record, Err(RequestError::ServiceUnavailable));
        }
        n
    }

    /// Fails every pending request with `ServiceUnavailable`.
    pub fn drain_all(&self) -> usize {
        let drained = self.registry.drain_all();
        let n = drained.len();
        for record in drained {
            self.finish(record, Err(RequestError::ServiceUnavailable));
        }
        n
    }

    pub(crate) fn reset_serials(&self) {
        self.serials.reset();
    }

    fn finish(&self, mut record: RequestRecord, outcome: Outcome) {
        if let Some(ticket) = record.hold.take() {
            self.holds.release_work(ticket);
        }
        record.complete(outcome);
    }
}
