//! # Observers
//!
//! Fan-out of unsolicited indications and radio power state to whoever
//! subscribed. Subscribers are plain crossbeam receivers; one that was
//! dropped is pruned the next time something is published to it.

use std::sync::Mutex;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::debug;

use crate::domain::Domain;
use crate::request::EventCode;

/// One unsolicited event as forwarded to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indication {
    pub domain: Domain,
    pub code: EventCode,
    pub payload: Bytes,
}

/// Power state of the radio as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioPowerState {
    Off,
    Unavailable,
    On,
}

impl RadioPowerState {
    /// Decodes the state byte carried by a radio-state indication.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(RadioPowerState::Off),
            1 => Some(RadioPowerState::Unavailable),
            10 => Some(RadioPowerState::On),
            _ => None,
        }
    }
}

struct Subscriber {
    /// `None` subscribes to every domain.
    domain: Option<Domain>,
    tx: Sender<Indication>,
}

struct HubInner {
    indications: Vec<Subscriber>,
    power: Vec<Sender<RadioPowerState>>,
    radio_state: RadioPowerState,
}

pub struct EventHub {
    inner: Mutex<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub {
            inner: Mutex::new(HubInner {
                indications: Vec::new(),
                power: Vec::new(),
                radio_state: RadioPowerState::Unavailable,
            }),
        }
    }

    pub fn subscribe(&self, domain: Domain) -> Receiver<Indication> {
        self.add_indication_subscriber(Some(domain))
    }

    pub fn subscribe_all(&self) -> Receiver<Indication> {
        self.add_indication_subscriber(None)
    }

    fn add_indication_subscriber(&self, domain: Option<Domain>) -> Receiver<Indication> {
        let (tx, rx) = unbounded();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .indications
            .push(Subscriber { domain, tx });
        rx
    }

    /// Receives every radio power state change from now on.
    pub fn subscribe_radio_state(&self) -> Receiver<RadioPowerState> {
        let (tx, rx) = unbounded();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .power
            .push(tx);
        rx
    }

    /// Delivers `indication` to matching subscribers; returns how many got it.
    pub fn publish(&self, indication: Indication) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        inner.indications.retain(|sub| {
            if sub.domain.is_some_and(|d| d != indication.domain) {
                return true;
            }
            match sub.tx.send(indication.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        if delivered == 0 {
            debug!(domain = %indication.domain, code = %indication.code, "indication had no observers");
        }
        delivered
    }

    /// Records a new power state. Observers hear about it when it changed,
    /// or always when `force` is set. Returns whether they were notified.
    pub fn set_radio_state(&self, state: RadioPowerState, force: bool) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.radio_state == state && !force {
            return false;
        }
        inner.radio_state = state;
        inner.power.retain(|tx| tx.send(state).is_ok());
        true
    }

    pub fn radio_state(&self) -> RadioPowerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).radio_state
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indication(domain: Domain) -> Indication {
        Indication {
            domain,
            code: EventCode::SIGNAL_STRENGTH,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn domain_subscribers_only_see_their_domain() {
        let hub = EventHub::new();
        let net = hub.subscribe(Domain::Network);
        let all = hub.subscribe_all();

        assert_eq!(hub.publish(indication(Domain::Network)), 2);
        assert_eq!(hub.publish(indication(Domain::Voice)), 1);

        assert_eq!(net.try_iter().count(), 1);
        assert_eq!(all.try_iter().count(), 2);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        drop(hub.subscribe(Domain::Sim));
        assert_eq!(hub.publish(indication(Domain::Sim)), 0);
        assert!(hub.inner.lock().unwrap().indications.is_empty());
    }

    #[test]
    fn radio_state_notifies_on_change_or_force() {
        let hub = EventHub::new();
        let rx = hub.subscribe_radio_state();
        assert!(!hub.set_radio_state(RadioPowerState::Unavailable, false));
        assert!(hub.set_radio_state(RadioPowerState::On, false));
        assert!(!hub.set_radio_state(RadioPowerState::On, false));
        assert!(hub.set_radio_state(RadioPowerState::On, true));
        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen, vec![RadioPowerState::On, RadioPowerState::On]);
    }

    #[test]
    fn wire_values() {
        assert_eq!(RadioPowerState::from_wire(10), Some(RadioPowerState::On));
        assert_eq!(RadioPowerState::from_wire(0), Some(RadioPowerState::Off));
        assert_eq!(RadioPowerState::from_wire(7), None);
    }
}
