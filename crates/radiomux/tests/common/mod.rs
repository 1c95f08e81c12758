//! In-process locator for integration tests: every declared domain binds
//! at its top revision and requests are only recorded, never answered.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use radiomux::{
    BindError, Connection, Domain, HalVersion, LinkHooks, OutboundRequest, ResponseInfo,
    SendError, Serial, ServiceLocator,
};

pub struct RecordingConnection {
    domain: Domain,
    sent: Arc<Mutex<Vec<(Domain, OutboundRequest)>>>,
}

impl Connection for RecordingConnection {
    fn send(&self, request: &OutboundRequest) -> Result<(), SendError> {
        self.sent.lock().unwrap().push((self.domain, request.clone()));
        Ok(())
    }

    fn send_ack(&self) -> Result<(), SendError> {
        Ok(())
    }
}

pub struct TestLocator {
    declared: Vec<Domain>,
    hooks: Mutex<HashMap<Domain, LinkHooks>>,
    pub sent: Arc<Mutex<Vec<(Domain, OutboundRequest)>>>,
}

impl TestLocator {
    pub fn split() -> Arc<Self> {
        Self::with(Domain::SPLIT.to_vec())
    }

    pub fn legacy() -> Arc<Self> {
        Self::with(vec![Domain::Radio])
    }

    pub fn with(declared: Vec<Domain>) -> Arc<Self> {
        Arc::new(TestLocator {
            declared,
            hooks: Mutex::new(HashMap::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Hooks installed by the most recent bind of `domain`.
    pub fn hooks(&self, domain: Domain) -> Option<LinkHooks> {
        self.hooks.lock().unwrap().get(&domain).cloned()
    }

    /// Endpoint domain a serial was most recently sent on.
    pub fn sent_on(&self, serial: Serial) -> Option<Domain> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, r)| r.serial == serial)
            .map(|(d, _)| *d)
    }

    /// Answers `serial` through the current hooks of the endpoint it was
    /// sent on.
    pub fn respond(&self, serial: Serial, payload: &'static [u8]) {
        if let Some(hooks) = self.sent_on(serial).and_then(|d| self.hooks(d)) {
            hooks.sink.solicited(ResponseInfo::ok(serial), Bytes::from_static(payload));
        }
    }

    pub fn ack(&self, serial: Serial) {
        if let Some(hooks) = self.sent_on(serial).and_then(|d| self.hooks(d)) {
            hooks.sink.request_ack(serial);
        }
    }
}

impl ServiceLocator for TestLocator {
    fn is_declared(&self, domain: Domain) -> bool {
        self.declared.contains(&domain)
    }

    fn connect(
        &self,
        domain: Domain,
        version: HalVersion,
        hooks: LinkHooks,
    ) -> Result<Arc<dyn Connection>, BindError> {
        if version != domain.version_ladder()[0] {
            return Err(BindError::NotFound);
        }
        self.hooks.lock().unwrap().insert(domain, hooks);
        Ok(Arc::new(RecordingConnection {
            domain,
            sent: self.sent.clone(),
        }))
    }
}

/// Collects every completion delivered to request `id`.
#[derive(Clone, Default)]
pub struct Completions {
    counts: Arc<Mutex<HashMap<usize, usize>>>,
}

impl Completions {
    pub fn completion(&self, id: usize) -> radiomux::request::Completion {
        let counts = self.counts.clone();
        Box::new(move |_| {
            *counts.lock().unwrap().entry(id).or_insert(0) += 1;
        })
    }

    pub fn count(&self, id: usize) -> usize {
        self.counts.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn max(&self) -> usize {
        self.counts.lock().unwrap().values().copied().max().unwrap_or(0)
    }
}
