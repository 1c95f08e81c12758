//! # Transport Boundary
//!
//! The codec that marshals requests to the modem lives outside this crate.
//! It plugs in through two traits:
//!
//! - [`ServiceLocator`] answers which domains the device declares and opens
//!   a [`Connection`] for one domain at one protocol revision.
//! - [`Connection`] sends encoded requests and acknowledgments.
//!
//! In the other direction the codec reports through the [`LinkHooks`] it
//! received when connecting: a [`ResponseSink`] for responses and
//! indications, and a [`DeathHook`] for connection loss. Both are stamped
//! with the endpoint generation they were created for, so anything a
//! superseded connection reports is recognised as stale.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::domain::{Domain, HalVersion};
use crate::error::{BindError, SendError};
use crate::request::{EventCode, IndicationKind, RequestCode, ResponseInfo};
use crate::serial::Serial;
use crate::supervisor::SupervisorEvent;

/// A request as handed to the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub serial: Serial,
    pub code: RequestCode,
    pub args: Bytes,
    /// Older revision the codec should encode for, when overridden.
    pub version_override: Option<HalVersion>,
}

/// Live connection to one remote service.
pub trait Connection: Send + Sync {
    /// Hands one request to the remote side without waiting for an answer.
    fn send(&self, request: &OutboundRequest) -> Result<(), SendError>;

    /// Confirms receipt of an ack-expected response or indication.
    fn send_ack(&self) -> Result<(), SendError>;

    /// Releases the connection. Called once, after it was superseded.
    fn close(&self) {}
}

/// Discovery and binding of remote services.
pub trait ServiceLocator: Send + Sync {
    /// Whether the device declares `domain` at all.
    fn is_declared(&self, domain: Domain) -> bool;

    /// Opens `domain` at exactly `version`.
    ///
    /// [`BindError::NotFound`] means this revision is not offered and the
    /// next lower one is tried; [`BindError::Unavailable`] means the service
    /// should be retried later.
    fn connect(
        &self,
        domain: Domain,
        version: HalVersion,
        hooks: LinkHooks,
    ) -> Result<Arc<dyn Connection>, BindError>;
}

/// Endpoint generation a callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    pub domain: Domain,
    pub cookie: u64,
}

/// Callbacks installed on a connection when it is bound.
#[derive(Clone)]
pub struct LinkHooks {
    pub sink: ResponseSink,
    pub death: DeathHook,
}

impl LinkHooks {
    pub(crate) fn new(
        origin: Origin,
        dispatcher: Weak<Dispatcher>,
        supervisor: Sender<SupervisorEvent>,
    ) -> Self {
        LinkHooks {
            sink: ResponseSink { origin, dispatcher },
            death: DeathHook { origin, supervisor },
        }
    }

    pub fn origin(&self) -> Origin {
        self.sink.origin
    }
}

/// Entry point for everything the modem sends back on one connection.
#[derive(Clone)]
pub struct ResponseSink {
    origin: Origin,
    dispatcher: Weak<Dispatcher>,
}

impl ResponseSink {
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// A solicited response (or, for [`SolicitedAck`], a receipt).
    ///
    /// [`SolicitedAck`]: crate::request::ResponseKind::SolicitedAck
    pub fn solicited(&self, info: ResponseInfo, payload: Bytes) {
        match self.dispatcher.upgrade() {
            Some(d) => d.on_solicited_response(self.origin, info, payload),
            None => debug!(serial = %info.serial, "response after shutdown dropped"),
        }
    }

    /// Receipt of a request; the full response follows later.
    pub fn request_ack(&self, serial: Serial) {
        if let Some(d) = self.dispatcher.upgrade() {
            d.on_request_ack(self.origin, serial);
        }
    }

    /// A remote-initiated indication.
    pub fn unsolicited(&self, kind: IndicationKind, code: EventCode, payload: Bytes) {
        if let Some(d) = self.dispatcher.upgrade() {
            d.on_unsolicited(self.origin, kind, code, payload);
        }
    }
}

/// Loss notification for one connection generation.
#[derive(Clone)]
pub struct DeathHook {
    origin: Origin,
    supervisor: Sender<SupervisorEvent>,
}

impl DeathHook {
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Reports the connection as dead. Safe to call more than once and
    /// after the connection was superseded.
    pub fn notify(&self) {
        let _ = self.supervisor.send(SupervisorEvent::ConnectionLost {
            domain: self.origin.domain,
            cookie: self.origin.cookie,
        });
    }
}
