//! # Request Surface
//!
//! Requests are data, not methods: a [`RequestTable`] maps each
//! [`RequestCode`] to the domain that serves it, the lowest protocol
//! revision that understands it and, for blocking calls, the neutral
//! payload synthesized when the modem does not answer in time.
//!
//! This module also carries the in-flight [`RequestRecord`] and the
//! response shapes the transport reports back.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use quanta::Instant;
use serde::{Deserialize, Serialize};

use crate::domain::{Domain, HalVersion};
use crate::error::{RadioError, RequestError};
use crate::hold::{AttributionTag, HoldTicket};
use crate::serial::Serial;

// ─── Codes ──────────────────────────────────────────────────────────────────

/// Identifier of one solicited command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestCode(pub u32);

impl RequestCode {
    pub const GET_SIM_STATUS: RequestCode = RequestCode(1);
    pub const ENTER_SIM_PIN: RequestCode = RequestCode(2);
    pub const GET_CURRENT_CALLS: RequestCode = RequestCode(9);
    pub const DIAL: RequestCode = RequestCode(10);
    pub const GET_IMSI: RequestCode = RequestCode(11);
    pub const HANGUP: RequestCode = RequestCode(12);
    pub const SIGNAL_STRENGTH: RequestCode = RequestCode(19);
    pub const VOICE_REGISTRATION_STATE: RequestCode = RequestCode(20);
    pub const DATA_REGISTRATION_STATE: RequestCode = RequestCode(21);
    pub const OPERATOR: RequestCode = RequestCode(22);
    pub const RADIO_POWER: RequestCode = RequestCode(23);
    pub const SEND_SMS: RequestCode = RequestCode(25);
    pub const SETUP_DATA_CALL: RequestCode = RequestCode(27);
    pub const SIM_IO: RequestCode = RequestCode(28);
    pub const BASEBAND_VERSION: RequestCode = RequestCode(51);
    pub const GET_ACTIVITY_INFO: RequestCode = RequestCode(135);
    pub const START_NETWORK_SCAN: RequestCode = RequestCode(142);
    pub const IMS_REGISTRATION_STATE: RequestCode = RequestCode(112);
    pub const IS_N1_MODE_ENABLED: RequestCode = RequestCode(226);
    pub const SET_NULL_CIPHER_AND_INTEGRITY: RequestCode = RequestCode(229);
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one unsolicited indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCode(pub u32);

impl EventCode {
    pub const RADIO_STATE_CHANGED: EventCode = EventCode(1000);
    pub const CALL_STATE_CHANGED: EventCode = EventCode(1001);
    pub const NEW_SMS: EventCode = EventCode(1003);
    pub const NETWORK_STATE_CHANGED: EventCode = EventCode(1002);
    pub const SIGNAL_STRENGTH: EventCode = EventCode(1009);
    pub const DATA_CALL_LIST_CHANGED: EventCode = EventCode(1010);
    pub const SIM_STATUS_CHANGED: EventCode = EventCode(1019);
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Table ──────────────────────────────────────────────────────────────────

/// Static description of one request code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub code: RequestCode,
    pub name: &'static str,
    pub domain: Domain,
    pub min_version: HalVersion,
    /// Set for blocking calls: the neutral payload delivered if the modem
    /// has not answered within the blocking timeout.
    pub blocking_default: Option<Bytes>,
}

impl RequestSpec {
    pub fn new(code: RequestCode, name: &'static str, domain: Domain, min_version: HalVersion) -> Self {
        RequestSpec {
            code,
            name,
            domain,
            min_version,
            blocking_default: None,
        }
    }

    /// Marks this code as a blocking call answered with `default` on timeout.
    pub fn blocking(mut self, default: Bytes) -> Self {
        self.blocking_default = Some(default);
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking_default.is_some()
    }
}

/// Lookup table from request code to its [`RequestSpec`].
#[derive(Debug, Clone, Default)]
pub struct RequestTable {
    specs: HashMap<RequestCode, RequestSpec>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `spec.code`.
    pub fn register(&mut self, spec: RequestSpec) -> &mut Self {
        self.specs.insert(spec.code, spec);
        self
    }

    pub fn get(&self, code: RequestCode) -> Option<&RequestSpec> {
        self.specs.get(&code)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestSpec> {
        self.specs.values()
    }

    /// Catalog of the common codes.
    ///
    /// Modem activity info is the only blocking call; its neutral answer is
    /// an empty activity record (all counters zero).
    pub fn standard() -> Self {
        use Domain::*;
        use RequestCode as C;

        let mut table = RequestTable::new();
        let base = HalVersion::V1_4;
        table
            .register(RequestSpec::new(C::GET_SIM_STATUS, "GET_SIM_STATUS", Sim, base))
            .register(RequestSpec::new(C::ENTER_SIM_PIN, "ENTER_SIM_PIN", Sim, base))
            .register(RequestSpec::new(C::GET_IMSI, "GET_IMSI", Sim, base))
            .register(RequestSpec::new(C::SIM_IO, "SIM_IO", Sim, base))
            .register(RequestSpec::new(C::GET_CURRENT_CALLS, "GET_CURRENT_CALLS", Voice, base))
            .register(RequestSpec::new(C::DIAL, "DIAL", Voice, base))
            .register(RequestSpec::new(C::HANGUP, "HANGUP", Voice, base))
            .register(RequestSpec::new(C::SIGNAL_STRENGTH, "SIGNAL_STRENGTH", Network, base))
            .register(RequestSpec::new(
                C::VOICE_REGISTRATION_STATE,
                "VOICE_REGISTRATION_STATE",
                Network,
                base,
            ))
            .register(RequestSpec::new(
                C::DATA_REGISTRATION_STATE,
                "DATA_REGISTRATION_STATE",
                Network,
                base,
            ))
            .register(RequestSpec::new(C::OPERATOR, "OPERATOR", Network, base))
            .register(RequestSpec::new(C::START_NETWORK_SCAN, "START_NETWORK_SCAN", Network, base))
            .register(RequestSpec::new(
                C::IS_N1_MODE_ENABLED,
                "IS_N1_MODE_ENABLED",
                Network,
                HalVersion::V2_2,
            ))
            .register(RequestSpec::new(
                C::SET_NULL_CIPHER_AND_INTEGRITY,
                "SET_NULL_CIPHER_AND_INTEGRITY",
                Network,
                HalVersion::V2_1,
            ))
            .register(RequestSpec::new(C::RADIO_POWER, "RADIO_POWER", Modem, base))
            .register(RequestSpec::new(C::BASEBAND_VERSION, "BASEBAND_VERSION", Modem, base))
            .register(
                RequestSpec::new(C::GET_ACTIVITY_INFO, "GET_ACTIVITY_INFO", Modem, base)
                    .blocking(Bytes::from_static(&[0u8; 16])),
            )
            .register(RequestSpec::new(C::SEND_SMS, "SEND_SMS", Messaging, base))
            .register(RequestSpec::new(C::SETUP_DATA_CALL, "SETUP_DATA_CALL", Data, base))
            .register(RequestSpec::new(
                C::IMS_REGISTRATION_STATE,
                "IMS_REGISTRATION_STATE",
                Ims,
                HalVersion::V2_0,
            ));
        table
    }
}

// ─── Response shapes ────────────────────────────────────────────────────────

/// How the modem wants a solicited response handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Solicited,
    /// Receipt confirmation only; the real response follows later.
    SolicitedAck,
    /// A normal response that must be acknowledged back to the modem.
    SolicitedAckExpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicationKind {
    Unsolicited,
    UnsolicitedAckExpected,
}

/// Header accompanying every solicited response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseInfo {
    pub serial: Serial,
    pub kind: ResponseKind,
    pub error: RadioError,
}

impl ResponseInfo {
    pub fn ok(serial: Serial) -> Self {
        ResponseInfo {
            serial,
            kind: ResponseKind::Solicited,
            error: RadioError::NONE,
        }
    }

    pub fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_error(mut self, error: RadioError) -> Self {
        self.error = error;
        self
    }
}

/// Successful outcome handed to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub serial: Serial,
    pub code: RequestCode,
    pub payload: Bytes,
    /// True when the payload is the blocking-call default rather than a
    /// modem answer.
    pub synthesized: bool,
}

pub type Outcome = Result<Response, RequestError>;

/// Caller continuation, invoked exactly once.
pub type Completion = Box<dyn FnOnce(Outcome) + Send + 'static>;

// ─── In-flight record ───────────────────────────────────────────────────────

/// One outstanding request, owned by the pending registry.
pub struct RequestRecord {
    pub serial: Serial,
    pub code: RequestCode,
    /// Endpoint the request was sent on (after topology routing).
    pub domain: Domain,
    pub issued_at: Instant,
    pub tag: AttributionTag,
    /// Endpoint generation the request was sent under.
    pub cookie: u64,
    /// Serial epoch the serial was allocated in.
    pub epoch: u64,
    /// Work hold, taken at most once: by a request ack or by completion.
    pub hold: Option<HoldTicket>,
    completion: Completion,
}

impl RequestRecord {
    pub fn new(
        serial: Serial,
        code: RequestCode,
        domain: Domain,
        tag: AttributionTag,
        cookie: u64,
        completion: Completion,
    ) -> Self {
        RequestRecord {
            serial,
            code,
            domain,
            issued_at: Instant::now(),
            tag,
            cookie,
            epoch: 0,
            hold: None,
            completion,
        }
    }

    /// Delivers the outcome. Consumes the record, so it can only happen once.
    pub fn complete(self, outcome: Outcome) {
        (self.completion)(outcome)
    }
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("serial", &self.serial)
            .field("code", &self.code)
            .field("domain", &self.domain)
            .field("cookie", &self.cookie)
            .field("epoch", &self.epoch)
            .field("held", &self.hold.is_some())
            .finish()
    }
}
