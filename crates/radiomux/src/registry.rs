//! # Pending Request Registry
//!
//! Single source of truth for "is this request still outstanding". One
//! mutex guards one map; every terminal path (response, reset, blocking
//! timeout, shutdown) goes through [`PendingRegistry::remove`] or a drain,
//! and whoever gets the record back is the only party allowed to complete
//! it.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, error};

use crate::domain::Domain;
use crate::error::RegistryError;
use crate::hold::HoldTicket;
use crate::request::RequestRecord;
use crate::serial::Serial;

#[derive(Debug, Default)]
pub struct PendingRegistry {
    inner: Mutex<HashMap<Serial, RequestRecord>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `record` under its serial.
    ///
    /// Serials restart after a full restart, so a record from an older
    /// epoch may still hold the number. The newer record wins: an older
    /// occupant is evicted and returned for the caller to fail, an older
    /// newcomer is refused as superseded. A collision within one epoch is
    /// an allocator defect: it is logged and the record handed back
    /// untouched so the caller can still complete it.
    pub fn insert(
        &self,
        record: RequestRecord,
    ) -> Result<Option<RequestRecord>, (RegistryError, RequestRecord)> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let serial = record.serial;
        let Some(existing) = map.get(&serial) else {
            map.insert(serial, record);
            return Ok(None);
        };
        match existing.epoch.cmp(&record.epoch) {
            std::cmp::Ordering::Less => {
                debug!(%serial, "evicting request left over from before a restart");
                Ok(map.insert(serial, record))
            }
            std::cmp::Ordering::Greater => Err((RegistryError::Superseded(serial), record)),
            std::cmp::Ordering::Equal => {
                error!(%serial, code = %record.code, "serial collision in pending registry");
                Err((RegistryError::Duplicate(serial), record))
            }
        }
    }

    /// Removes and returns the record for `serial`, at most once.
    pub fn remove(&self, serial: Serial) -> Option<RequestRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&serial)
    }

    /// Removes the record for `serial` only if `accept` approves it; a
    /// rejected record stays registered.
    pub fn remove_if<F>(&self, serial: Serial, accept: F) -> Option<RequestRecord>
    where
        F: FnOnce(&RequestRecord) -> bool,
    {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(&serial).is_some_and(accept) {
            map.remove(&serial)
        } else {
            None
        }
    }

    /// Detaches the work hold of a still-pending request, leaving the record
    /// registered. Returns `None` if the request is gone, `accept` rejects
    /// it, or its hold was already taken.
    pub fn take_hold<F>(&self, serial: Serial, accept: F) -> Option<HoldTicket>
    where
        F: FnOnce(&RequestRecord) -> bool,
    {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let record = map.get_mut(&serial)?;
        if !accept(record) {
            return None;
        }
        record.hold.take()
    }

    /// Atomically removes every record sent on `domain`, ordered by serial.
    pub fn drain(&self, domain: Domain) -> Vec<RequestRecord> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let serials: Vec<Serial> = map
            .iter()
            .filter(|(_, r)| r.domain == domain)
            .map(|(s, _)| *s)
            .collect();
        let mut drained: Vec<RequestRecord> =
            serials.into_iter().filter_map(|s| map.remove(&s)).collect();
        drained.sort_by_key(|r| r.serial);
        drained
    }

    /// Atomically removes every record, ordered by serial.
    pub fn drain_all(&self) -> Vec<RequestRecord> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained: Vec<RequestRecord> = map.drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|r| r.serial);
        drained
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&serial)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding serials, sorted.
    pub fn serials(&self) -> Vec<Serial> {
        let mut serials: Vec<Serial> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        serials.sort();
        serials
    }

    /// Outstanding serials sent on `domain`, sorted.
    pub fn serials_for(&self, domain: Domain) -> Vec<Serial> {
        let mut serials: Vec<Serial> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.domain == domain)
            .map(|r| r.serial)
            .collect();
        serials.sort();
        serials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hold::AttributionTag;
    use crate::request::RequestCode;

    fn record(serial: u32, domain: Domain) -> RequestRecord {
        RequestRecord::new(
            Serial(serial),
            RequestCode::DIAL,
            domain,
            AttributionTag::new("test"),
            1,
            Box::new(|_| {}),
        )
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = PendingRegistry::new();
        registry.insert(record(1, Domain::Sim)).unwrap();
        assert!(registry.contains(Serial(1)));
        assert!(registry.remove(Serial(1)).is_some());
        assert!(registry.remove(Serial(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_if_leaves_rejected_record() {
        let registry = PendingRegistry::new();
        registry.insert(record(4, Domain::Sim)).unwrap();
        assert!(registry.remove_if(Serial(4), |r| r.cookie == 2).is_none());
        assert!(registry.contains(Serial(4)));
        assert!(registry.remove_if(Serial(4), |r| r.cookie == 1).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_insert_returns_record() {
        let registry = PendingRegistry::new();
        registry.insert(record(3, Domain::Sim)).unwrap();
        let (err, rejected) = registry.insert(record(3, Domain::Voice)).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(Serial(3)));
        assert_eq!(rejected.domain, Domain::Voice);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn newer_epoch_wins_a_reused_serial() {
        let registry = PendingRegistry::new();
        registry.insert(record(1, Domain::Sim)).unwrap();

        let mut newer = record(1, Domain::Voice);
        newer.epoch = 1;
        let evicted = registry.insert(newer).unwrap().unwrap();
        assert_eq!(evicted.domain, Domain::Sim);
        assert_eq!(evicted.epoch, 0);

        let (err, refused) = registry.insert(record(1, Domain::Data)).unwrap_err();
        assert_eq!(err, RegistryError::Superseded(Serial(1)));
        assert_eq!(refused.domain, Domain::Data);
        assert!(registry.remove_if(Serial(1), |r| r.epoch == 1).is_some());
    }

    #[test]
    fn drain_only_touches_matching_domain() {
        let registry = PendingRegistry::new();
        registry.insert(record(2, Domain::Voice)).unwrap();
        registry.insert(record(1, Domain::Voice)).unwrap();
        registry.insert(record(3, Domain::Data)).unwrap();

        let drained: Vec<Serial> = registry.drain(Domain::Voice).into_iter().map(|r| r.serial).collect();
        assert_eq!(drained, vec![Serial(1), Serial(2)]);
        assert_eq!(registry.serials(), vec![Serial(3)]);
        assert!(registry.drain(Domain::Voice).is_empty());
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = PendingRegistry::new();
        for s in 1..=5 {
            registry.insert(record(s, Domain::Modem)).unwrap();
        }
        assert_eq!(registry.serials_for(Domain::Modem).len(), 5);
        assert_eq!(registry.drain_all().len(), 5);
        assert!(registry.is_empty());
    }
}
