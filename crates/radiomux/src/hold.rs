//! # Resource Holds
//!
//! Two counted holds on the always-on power resource:
//!
//! - **work**: held while at least one request is outstanding.
//! - **ack**: held briefly after an acknowledgment is sent back to the
//!   modem. Not reference counted; only its auto-release clears it.
//!
//! Every acquire bumps a sequence number and schedules an auto-release
//! carrying that number. The auto-release only fires if the sequence is
//! still current, so a timer armed for an older hold can never release a
//! newer one. Clearing the work hold on timeout also advances an epoch;
//! tickets from before the clear are then ignored on release.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::timer::{Scheduler, TimerEvent};

// ─── Attribution ────────────────────────────────────────────────────────────

/// Label under which a work hold is accounted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributionTag(String);

impl AttributionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        AttributionTag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AttributionTag {
    fn default() -> Self {
        AttributionTag::new("radiomux")
    }
}

impl fmt::Display for AttributionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of one work-hold acquisition. Not `Clone`: releasing consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct HoldTicket {
    epoch: u64,
    tag: AttributionTag,
}

impl HoldTicket {
    pub fn tag(&self) -> &AttributionTag {
        &self.tag
    }
}

// ─── Power resource ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldKind {
    Work,
    Ack,
}

/// The always-on resource a hold keeps engaged.
pub trait PowerResource: Send + Sync {
    fn set_held(&self, kind: HoldKind, held: bool);

    /// Active attribution tags for the work hold. Called whenever a tag
    /// becomes active or idle.
    fn set_attribution(&self, tags: &[AttributionTag]) {
        let _ = tags;
    }
}

/// Default resource that only logs transitions.
#[derive(Debug, Default)]
pub struct LoggingPower;

impl PowerResource for LoggingPower {
    fn set_held(&self, kind: HoldKind, held: bool) {
        debug!(?kind, held, "power hold");
    }

    fn set_attribution(&self, tags: &[AttributionTag]) {
        debug!(clients = tags.len(), "power attribution updated");
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldTimeouts {
    pub work: Duration,
    pub ack: Duration,
}

impl Default for HoldTimeouts {
    fn default() -> Self {
        HoldTimeouts {
            work: Duration::from_millis(60_000),
            ack: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct WorkHold {
    count: u32,
    seq: u64,
    epoch: u64,
    clients: HashMap<AttributionTag, u32>,
}

#[derive(Default)]
struct AckHold {
    seq: u64,
    held: bool,
}

pub struct HoldController {
    work: Mutex<WorkHold>,
    ack: Mutex<AckHold>,
    power: Arc<dyn PowerResource>,
    scheduler: Arc<dyn Scheduler>,
    timeouts: HoldTimeouts,
}

impl HoldController {
    pub fn new(
        power: Arc<dyn PowerResource>,
        scheduler: Arc<dyn Scheduler>,
        timeouts: HoldTimeouts,
    ) -> Self {
        HoldController {
            work: Mutex::new(WorkHold::default()),
            ack: Mutex::new(AckHold::default()),
            power,
            scheduler,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> HoldTimeouts {
        self.timeouts
    }

    /// Takes one work hold for `tag` and re-arms the auto-release.
    pub fn acquire_work(&self, tag: &AttributionTag) -> HoldTicket {
        let mut work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        if work.count == 0 {
            self.power.set_held(HoldKind::Work, true);
        }
        work.count += 1;
        work.seq += 1;

        let clients = work.clients.entry(tag.clone()).or_insert(0);
        *clients += 1;
        if *clients == 1 {
            self.publish_attribution(&work);
        }

        self.scheduler
            .schedule(self.timeouts.work, TimerEvent::WorkHoldExpired { seq: work.seq });
        HoldTicket {
            epoch: work.epoch,
            tag: tag.clone(),
        }
    }

    /// Gives one work hold back. Returns false when the ticket is stale
    /// (the hold was cleared by a timeout since it was issued).
    pub fn release_work(&self, ticket: HoldTicket) -> bool {
        let mut work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        if ticket.epoch != work.epoch || work.count == 0 {
            debug!(tag = %ticket.tag, "stale work hold release ignored");
            return false;
        }

        if let Some(n) = work.clients.get_mut(&ticket.tag) {
            *n -= 1;
            if *n == 0 {
                work.clients.remove(&ticket.tag);
                self.publish_attribution(&work);
            }
        }

        work.count -= 1;
        if work.count == 0 {
            self.power.set_held(HoldKind::Work, false);
        }
        true
    }

    /// Takes the ack hold and re-arms its auto-release.
    pub fn acquire_ack(&self) {
        let mut ack = self.ack.lock().unwrap_or_else(|e| e.into_inner());
        if !ack.held {
            self.power.set_held(HoldKind::Ack, true);
            ack.held = true;
        }
        ack.seq += 1;
        self.scheduler
            .schedule(self.timeouts.ack, TimerEvent::AckHoldExpired { seq: ack.seq });
    }

    /// Auto-release of the work hold. Clears it entirely when `seq` is
    /// still current; returns whether anything was released.
    pub fn on_work_timeout(&self, seq: u64) -> bool {
        let mut work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        if seq != work.seq || work.count == 0 {
            return false;
        }
        warn!(
            count = work.count,
            clients = work.clients.len(),
            "work hold timed out, clearing"
        );
        work.count = 0;
        work.epoch += 1;
        work.clients.clear();
        self.publish_attribution(&work);
        self.power.set_held(HoldKind::Work, false);
        true
    }

    /// Auto-release of the ack hold when `seq` is still current.
    pub fn on_ack_timeout(&self, seq: u64) -> bool {
        let mut ack = self.ack.lock().unwrap_or_else(|e| e.into_inner());
        if seq != ack.seq || !ack.held {
            return false;
        }
        ack.held = false;
        self.power.set_held(HoldKind::Ack, false);
        true
    }

    /// Drops both holds regardless of outstanding tickets.
    pub fn clear(&self) {
        {
            let mut work = self.work.lock().unwrap_or_else(|e| e.into_inner());
            if work.count > 0 {
                info!(count = work.count, "clearing work hold");
                work.count = 0;
                work.clients.clear();
                self.publish_attribution(&work);
                self.power.set_held(HoldKind::Work, false);
            }
            work.epoch += 1;
        }
        let mut ack = self.ack.lock().unwrap_or_else(|e| e.into_inner());
        if ack.held {
            ack.held = false;
            self.power.set_held(HoldKind::Ack, false);
        }
    }

    pub fn work_count(&self) -> u32 {
        self.work.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn is_work_held(&self) -> bool {
        self.work_count() > 0
    }

    pub fn is_ack_held(&self) -> bool {
        self.ack.lock().unwrap_or_else(|e| e.into_inner()).held
    }

    /// Tags with at least one outstanding work hold, sorted.
    pub fn active_clients(&self) -> Vec<AttributionTag> {
        let work = self.work.lock().unwrap_or_else(|e| e.into_inner());
        sorted_tags(&work)
    }

    fn publish_attribution(&self, work: &WorkHold) {
        self.power.set_attribution(&sorted_tags(work));
    }
}

fn sorted_tags(work: &WorkHold) -> Vec<AttributionTag> {
    let mut tags: Vec<AttributionTag> = work.clients.keys().cloned().collect();
    tags.sort();
    tags
}
