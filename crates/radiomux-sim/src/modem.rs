//! Scriptable in-process modem.
//!
//! [`MockModem`] implements [`ServiceLocator`] so it can be handed straight
//! to [`RadioMux::builder`](radiomux::RadioMux::builder). Each domain is
//! scripted independently: which revisions it offers, how many binds fail
//! transiently, whether requests are answered automatically after a delay
//! or left for the test to answer, and which sends fail.
//!
//! Fault injection never calls back into the multiplexer while the modem
//! lock is held, so continuations are free to issue new requests.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use radiomux::{
    BindError, Connection, Domain, EventCode, HalVersion, IndicationKind, LinkHooks,
    OutboundRequest, RadioError, RequestCode, ResponseInfo, ResponseKind, SendError, Serial,
    ServiceLocator,
};
use tracing::{debug, info, warn};

/// How a domain answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Requests are recorded; the test answers them explicitly.
    #[default]
    Manual,
    /// Every request is answered by the responder thread after `latency`.
    AutoRespond { latency: Duration },
}

/// Behaviour of one domain.
#[derive(Debug, Clone)]
pub struct DomainScript {
    /// Revisions this domain offers, any order.
    pub versions: Vec<HalVersion>,
    /// Binds that fail with [`BindError::Unavailable`] before one succeeds.
    pub transient_failures: u32,
    pub mode: ResponseMode,
}

impl DomainScript {
    pub fn offering(versions: &[HalVersion]) -> Self {
        DomainScript {
            versions: versions.to_vec(),
            transient_failures: 0,
            mode: ResponseMode::Manual,
        }
    }
}

/// One request the modem received.
#[derive(Clone)]
pub struct SentRequest {
    pub domain: Domain,
    pub serial: Serial,
    pub code: RequestCode,
    pub version_override: Option<HalVersion>,
    /// Generation of the connection it arrived on.
    pub cookie: u64,
    hooks: LinkHooks,
}

#[derive(Default)]
struct SendFaults {
    transport: u32,
    rejected: u32,
}

struct Link {
    hooks: LinkHooks,
    version: HalVersion,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct ModemState {
    scripts: HashMap<Domain, DomainScript>,
    links: HashMap<Domain, Link>,
    superseded: HashMap<Domain, Vec<LinkHooks>>,
    faults: HashMap<Domain, SendFaults>,
    sent: Vec<SentRequest>,
    binds: HashMap<Domain, u32>,
}

struct Shared {
    state: Mutex<ModemState>,
    acks: AtomicU32,
    closes: AtomicU32,
    responder: Sender<Delayed>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ModemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MockModem {
    shared: Arc<Shared>,
}

impl MockModem {
    /// A modem with no domains declared.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded();
        let modem = Arc::new(MockModem {
            shared: Arc::new(Shared {
                state: Mutex::new(ModemState::default()),
                acks: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                responder: tx,
            }),
        });
        let spawned = thread::Builder::new()
            .name("mock-modem-responder".into())
            .spawn(move || responder_loop(rx));
        if let Err(e) = spawned {
            warn!(error = %e, "responder thread not started, auto-respond disabled");
        }
        modem
    }

    /// Every split domain at revisions 2.0 through 2.2.
    pub fn split() -> Arc<Self> {
        let modem = Self::new();
        for domain in Domain::SPLIT {
            modem.declare(
                domain,
                DomainScript::offering(&[HalVersion::V2_0, HalVersion::V2_1, HalVersion::V2_2]),
            );
        }
        modem
    }

    /// Only the legacy endpoint, at revision 1.6.
    pub fn legacy() -> Arc<Self> {
        let modem = Self::new();
        modem.declare(Domain::Radio, DomainScript::offering(&[HalVersion::V1_6]));
        modem
    }

    pub fn declare(&self, domain: Domain, script: DomainScript) {
        self.shared.lock().scripts.insert(domain, script);
    }

    pub fn set_mode(&self, domain: Domain, mode: ResponseMode) {
        if let Some(script) = self.shared.lock().scripts.get_mut(&domain) {
            script.mode = mode;
        }
    }

    /// The next `n` binds of `domain` fail transiently.
    pub fn fail_binds(&self, domain: Domain, n: u32) {
        if let Some(script) = self.shared.lock().scripts.get_mut(&domain) {
            script.transient_failures = n;
        }
    }

    /// The next `n` sends on `domain` fail at the transport level.
    pub fn fail_sends(&self, domain: Domain, n: u32) {
        self.shared.lock().faults.entry(domain).or_default().transport = n;
    }

    /// The next `n` sends on `domain` are rejected by the codec.
    pub fn reject_sends(&self, domain: Domain, n: u32) {
        self.shared.lock().faults.entry(domain).or_default().rejected = n;
    }

    // ─── Inspection ─────────────────────────────────────────────────────

    pub fn sent(&self) -> Vec<SentRequest> {
        self.shared.lock().sent.clone()
    }

    pub fn sent_to(&self, domain: Domain) -> Vec<Serial> {
        self.shared
            .lock()
            .sent
            .iter()
            .filter(|r| r.domain == domain)
            .map(|r| r.serial)
            .collect()
    }

    pub fn binds(&self, domain: Domain) -> u32 {
        self.shared.lock().binds.get(&domain).copied().unwrap_or(0)
    }

    pub fn bound_version(&self, domain: Domain) -> Option<HalVersion> {
        self.shared.lock().links.get(&domain).map(|l| l.version)
    }

    pub fn acks(&self) -> u32 {
        self.shared.acks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    // ─── Answering ──────────────────────────────────────────────────────

    fn last_sent(&self, serial: Serial) -> Option<SentRequest> {
        self.shared
            .lock()
            .sent
            .iter()
            .rev()
            .find(|r| r.serial == serial)
            .cloned()
    }

    /// Answers `serial` on the connection it was sent on. Returns false if
    /// the modem never saw it.
    pub fn respond(&self, serial: Serial, payload: Bytes) -> bool {
        self.respond_with(ResponseInfo::ok(serial), payload)
    }

    /// Answers `serial` with a modem error status.
    pub fn respond_error(&self, serial: Serial, error: RadioError) -> bool {
        self.respond_with(ResponseInfo::ok(serial).with_error(error), Bytes::new())
    }

    /// Answers `serial` and asks for an acknowledgment.
    pub fn respond_ack_expected(&self, serial: Serial, payload: Bytes) -> bool {
        self.respond_with(
            ResponseInfo::ok(serial).with_kind(ResponseKind::SolicitedAckExpected),
            payload,
        )
    }

    fn respond_with(&self, info: ResponseInfo, payload: Bytes) -> bool {
        let Some(sent) = self.last_sent(info.serial) else {
            return false;
        };
        sent.hooks.sink.solicited(info, payload);
        true
    }

    /// Confirms receipt of `serial` ahead of its response.
    pub fn ack(&self, serial: Serial) -> bool {
        let Some(sent) = self.last_sent(serial) else {
            return false;
        };
        sent.hooks.sink.request_ack(serial);
        true
    }

    /// Raises an indication on the current connection of `domain`.
    pub fn indicate(
        &self,
        domain: Domain,
        kind: IndicationKind,
        code: EventCode,
        payload: Bytes,
    ) -> bool {
        let hooks = self.shared.lock().links.get(&domain).map(|l| l.hooks.clone());
        match hooks {
            Some(hooks) => {
                hooks.sink.unsolicited(kind, code, payload);
                true
            }
            None => false,
        }
    }

    // ─── Faults ─────────────────────────────────────────────────────────

    /// The remote service of `domain` dies. Returns false if nothing was
    /// bound.
    pub fn kill(&self, domain: Domain) -> bool {
        let link = {
            let mut state = self.shared.lock();
            let link = state.links.remove(&domain);
            if let Some(link) = &link {
                state
                    .superseded
                    .entry(domain)
                    .or_default()
                    .push(link.hooks.clone());
            }
            link
        };
        match link {
            Some(link) => {
                link.closed.store(true, Ordering::SeqCst);
                info!(%domain, cookie = link.hooks.origin().cookie, "mock service killed");
                link.hooks.death.notify();
                true
            }
            None => false,
        }
    }

    /// Every split service dies at once, as when the shared vendor
    /// process crashes.
    pub fn kill_all_non_legacy(&self) -> usize {
        Domain::SPLIT.into_iter().filter(|d| self.kill(*d)).count()
    }

    /// Replays the death notice of a connection that was already replaced.
    /// Returns false if `domain` has no superseded connection.
    pub fn kill_stale(&self, domain: Domain) -> bool {
        let hooks = self
            .shared
            .lock()
            .superseded
            .get(&domain)
            .and_then(|h| h.first().cloned());
        match hooks {
            Some(hooks) => {
                debug!(%domain, cookie = hooks.origin().cookie, "replaying stale death notice");
                hooks.death.notify();
                true
            }
            None => false,
        }
    }
}

impl ServiceLocator for MockModem {
    fn is_declared(&self, domain: Domain) -> bool {
        self.shared.lock().scripts.contains_key(&domain)
    }

    fn connect(
        &self,
        domain: Domain,
        version: HalVersion,
        hooks: LinkHooks,
    ) -> Result<Arc<dyn Connection>, BindError> {
        let mut state = self.shared.lock();
        let Some(script) = state.scripts.get_mut(&domain) else {
            return Err(BindError::NotFound);
        };
        if !script.versions.contains(&version) {
            return Err(BindError::NotFound);
        }
        if script.transient_failures > 0 {
            script.transient_failures -= 1;
            return Err(BindError::Unavailable("mock service not ready".into()));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let link = Link {
            hooks: hooks.clone(),
            version,
            closed: closed.clone(),
        };
        if let Some(old) = state.links.insert(domain, link) {
            state.superseded.entry(domain).or_default().push(old.hooks);
        }
        *state.binds.entry(domain).or_insert(0) += 1;

        Ok(Arc::new(MockConnection {
            domain,
            hooks,
            closed,
            shared: Arc::downgrade(&self.shared),
        }))
    }
}

// ─── Connection ─────────────────────────────────────────────────────────

struct MockConnection {
    domain: Domain,
    hooks: LinkHooks,
    closed: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

fn auto_payload(code: RequestCode) -> Bytes {
    match code {
        RequestCode::GET_ACTIVITY_INFO => {
            let mut counters = Vec::with_capacity(16);
            for ms in [1_000u32, 200, 30, 40] {
                counters.extend_from_slice(&ms.to_le_bytes());
            }
            Bytes::from(counters)
        }
        RequestCode::BASEBAND_VERSION => Bytes::from_static(b"MOCK-BB-1.0"),
        _ => Bytes::from_static(b"ok"),
    }
}

impl Connection for MockConnection {
    fn send(&self, request: &OutboundRequest) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Transport("remote service dead".into()));
        }
        let Some(shared) = self.shared.upgrade() else {
            return Err(SendError::Transport("modem gone".into()));
        };

        let mode = {
            let mut state = shared.lock();
            let faults = state.faults.entry(self.domain).or_default();
            if faults.transport > 0 {
                faults.transport -= 1;
                return Err(SendError::Transport("injected transport failure".into()));
            }
            if faults.rejected > 0 {
                faults.rejected -= 1;
                return Err(SendError::Rejected("injected codec rejection".into()));
            }
            state.sent.push(SentRequest {
                domain: self.domain,
                serial: request.serial,
                code: request.code,
                version_override: request.version_override,
                cookie: self.hooks.origin().cookie,
                hooks: self.hooks.clone(),
            });
            state
                .scripts
                .get(&self.domain)
                .map(|s| s.mode)
                .unwrap_or_default()
        };

        if let ResponseMode::AutoRespond { latency } = mode {
            let _ = shared.responder.send(Delayed {
                due: Instant::now() + latency,
                hooks: self.hooks.clone(),
                serial: request.serial,
                payload: auto_payload(request.code),
            });
        }
        Ok(())
    }

    fn send_ack(&self) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Transport("remote service dead".into()));
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.acks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ─── Responder thread ───────────────────────────────────────────────────

struct Delayed {
    due: Instant,
    hooks: LinkHooks,
    serial: Serial,
    payload: Bytes,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Earliest first out of a max-heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due)
    }
}

fn responder_loop(rx: Receiver<Delayed>) {
    let mut queue = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while queue.peek().is_some_and(|d: &Delayed| d.due <= now) {
            if let Some(d) = queue.pop() {
                d.hooks.sink.solicited(ResponseInfo::ok(d.serial), d.payload);
            }
        }
        let next = match queue.peek() {
            Some(d) => rx.recv_timeout(d.due.saturating_duration_since(now)),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(d) => queue.push(d),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
