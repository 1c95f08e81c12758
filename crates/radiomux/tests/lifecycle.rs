//! Integration tests for building, resetting, restarting and shutting
//! down a complete [`RadioMux`].

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{Completions, TestLocator};
use crossbeam_channel::unbounded;
use radiomux::command::GetBasebandVersion;
use radiomux::supervisor::SupervisorConfig;
use radiomux::{
    AttributionTag, BindError, ConfigError, Connection, Domain, EndpointState, HalVersion,
    LinkHooks, LossReason, MuxConfig, MuxError, RadioMux, RadioPowerState, RequestCode,
    RequestError, RequestHistograms, ResetPolicy, ResponseInfo, Serial, ServiceLocator,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn build(locator: Arc<TestLocator>, policy: ResetPolicy) -> RadioMux {
    let mut config = MuxConfig::default();
    config.supervisor.reset_policy = policy;
    RadioMux::builder(locator).config(config).build().unwrap()
}

fn issue(mux: &RadioMux, domain: Domain, code: RequestCode, completions: &Completions, id: usize) {
    mux.issue(
        domain,
        code,
        Bytes::new(),
        AttributionTag::new("lifecycle"),
        completions.completion(id),
    );
}

// ─── Topology ───────────────────────────────────────────────────────────────

#[test]
fn split_device_binds_every_split_domain() {
    init_tracing();
    let mux = build(TestLocator::split(), ResetPolicy::AllNonLegacy);
    assert_eq!(mux.topology(), radiomux::Topology::Split);
    for domain in Domain::SPLIT {
        let ep = mux.endpoint(domain);
        assert!(ep.is_bound(), "{domain} not bound");
        assert_eq!(ep.version, HalVersion::V2_2);
    }
    assert_eq!(mux.endpoint_state(Domain::Radio), EndpointState::Disabled);
}

#[test]
fn legacy_device_routes_everything_to_radio() {
    let locator = TestLocator::legacy();
    let mux = build(locator.clone(), ResetPolicy::AllNonLegacy);
    assert_eq!(mux.topology(), radiomux::Topology::Legacy);
    assert_eq!(mux.endpoint(Domain::Radio).version, HalVersion::V1_6);
    assert_eq!(mux.endpoint_state(Domain::Sim), EndpointState::Disabled);

    let completions = Completions::default();
    issue(&mux, Domain::Sim, RequestCode::GET_SIM_STATUS, &completions, 0);
    assert_eq!(locator.sent_on(Serial(1)), Some(Domain::Radio));

    // Minimum 2.0: not offered on a 1.6 legacy endpoint.
    issue(&mux, Domain::Ims, RequestCode::IMS_REGISTRATION_STATE, &completions, 1);
    assert_eq!(completions.count(1), 1);
    assert_eq!(mux.dispatcher().registry().len(), 1);

    locator.respond(Serial(1), b"ready");
    assert_eq!(completions.count(0), 1);
}

#[test]
fn typed_call_decodes_response() {
    let locator = TestLocator::split();
    let mux = build(locator.clone(), ResetPolicy::AllNonLegacy);
    let (tx, rx) = unbounded();
    mux.call(&GetBasebandVersion, AttributionTag::default(), move |out| {
        let _ = tx.send(out);
    });
    locator.respond(Serial(1), b"MPSS.HI.4.3");
    assert_eq!(rx.try_recv().unwrap().unwrap(), "MPSS.HI.4.3");
}

// ─── Loss & reset ───────────────────────────────────────────────────────────

#[test]
fn death_hook_resets_and_rebinds_asynchronously() {
    init_tracing();
    let locator = TestLocator::split();
    let mux = build(locator.clone(), ResetPolicy::SingleDomain);
    let completions = Completions::default();
    issue(&mux, Domain::Voice, RequestCode::GET_CURRENT_CALLS, &completions, 0);
    issue(&mux, Domain::Voice, RequestCode::DIAL, &completions, 1);
    issue(&mux, Domain::Sim, RequestCode::GET_SIM_STATUS, &completions, 2);

    let old_cookie = mux.endpoints().cookie(Domain::Voice);
    let death = locator.hooks(Domain::Voice).unwrap().death;
    death.notify();

    wait_until("voice drained", || completions.count(0) == 1 && completions.count(1) == 1);
    wait_until("voice rebound", || {
        mux.endpoint(Domain::Voice).is_bound() && mux.endpoints().cookie(Domain::Voice) > old_cookie
    });
    assert_eq!(completions.count(2), 0);
    assert_eq!(mux.endpoints().resets(Domain::Voice), 1);
    assert_eq!(mux.endpoints().resets(Domain::Sim), 0);

    // Delivered a second time, the same hook is stale.
    death.notify();
    locator.respond(Serial(3), b"sim");
    wait_until("sim answered", || completions.count(2) == 1);
    assert_eq!(mux.endpoints().resets(Domain::Voice), 1);
}

#[test]
fn drained_continuation_may_reset_and_restart() {
    init_tracing();
    let locator = TestLocator::split();
    let mut mux = build(locator.clone(), ResetPolicy::SingleDomain);
    let (tx, rx) = unbounded();

    // Drained by a death notice on the supervisor thread; reacts by
    // resetting another domain from inside its continuation.
    let supervisor = mux.supervisor().clone();
    let done = tx.clone();
    mux.issue(
        Domain::Voice,
        RequestCode::DIAL,
        Bytes::new(),
        AttributionTag::new("lifecycle"),
        Box::new(move |outcome| {
            if matches!(outcome, Err(RequestError::ServiceUnavailable)) {
                supervisor.reset(Domain::Sim, LossReason::Requested);
            }
            let _ = done.send("voice");
        }),
    );
    locator.hooks(Domain::Voice).unwrap().death.notify();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "voice");
    wait_until("sim reset by continuation", || {
        mux.endpoints().resets(Domain::Sim) == 1 && mux.endpoint(Domain::Sim).is_bound()
    });
    wait_until("voice rebound", || mux.endpoint(Domain::Voice).is_bound());

    // Drained by a reset on this thread; restarts the whole subsystem.
    let supervisor = mux.supervisor().clone();
    mux.issue(
        Domain::Data,
        RequestCode::SETUP_DATA_CALL,
        Bytes::new(),
        AttributionTag::new("lifecycle"),
        Box::new(move |outcome| {
            if matches!(outcome, Err(RequestError::ServiceUnavailable)) {
                supervisor.restart(&[]);
            }
            let _ = tx.send("data");
        }),
    );
    mux.supervisor().reset(Domain::Data, LossReason::Requested);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "data");
    assert_eq!(mux.dispatcher().serials().epoch(), 1);
    for domain in Domain::SPLIT {
        assert!(mux.endpoint(domain).is_bound(), "{domain} not rebound");
    }

    // The supervisor thread is still alive and shutdown joins it.
    let cookie = mux.endpoints().cookie(Domain::Ims);
    locator.hooks(Domain::Ims).unwrap().death.notify();
    wait_until("ims rebound", || {
        mux.endpoint(Domain::Ims).is_bound() && mux.endpoints().cookie(Domain::Ims) > cookie
    });
    mux.shutdown();
}

#[test]
fn all_non_legacy_policy_resets_siblings() {
    let locator = TestLocator::split();
    let histograms = Arc::new(RequestHistograms::new());
    let mut config = MuxConfig::default();
    config.supervisor.reset_policy = ResetPolicy::AllNonLegacy;
    let mux = RadioMux::builder(locator.clone())
        .config(config)
        .telemetry(histograms.clone())
        .build()
        .unwrap();
    let completions = Completions::default();
    issue(&mux, Domain::Voice, RequestCode::DIAL, &completions, 0);
    issue(&mux, Domain::Data, RequestCode::SETUP_DATA_CALL, &completions, 1);

    let reset = mux.supervisor().reset(Domain::Voice, LossReason::Requested);
    assert_eq!(reset, Domain::SPLIT.to_vec());
    assert_eq!(completions.count(0), 1);
    assert_eq!(completions.count(1), 1);
    for domain in Domain::SPLIT {
        assert!(mux.endpoint(domain).is_bound());
        assert_eq!(histograms.losses(domain), 1);
    }
    assert!(histograms
        .render_prometheus()
        .contains("radiomux_endpoint_resets_total{domain=\"data\",reason=\"sibling\"} 1"));
}

#[test]
fn send_failure_triggers_reset() {
    struct BrokenPipe;
    impl Connection for BrokenPipe {
        fn send(&self, _: &radiomux::OutboundRequest) -> Result<(), radiomux::SendError> {
            Err(radiomux::SendError::Transport("broken pipe".into()))
        }
        fn send_ack(&self) -> Result<(), radiomux::SendError> {
            Ok(())
        }
    }
    struct BrokenLocator {
        binds: AtomicU32,
    }
    impl ServiceLocator for BrokenLocator {
        fn is_declared(&self, domain: Domain) -> bool {
            domain == Domain::Sim
        }
        fn connect(
            &self,
            _: Domain,
            _: HalVersion,
            _: LinkHooks,
        ) -> Result<Arc<dyn Connection>, BindError> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(BrokenPipe))
        }
    }

    let locator = Arc::new(BrokenLocator {
        binds: AtomicU32::new(0),
    });
    let mux = RadioMux::builder(locator.clone()).build().unwrap();
    let completions = Completions::default();
    issue(&mux, Domain::Sim, RequestCode::GET_IMSI, &completions, 0);

    wait_until("request drained", || completions.count(0) == 1);
    wait_until("sim rebound", || locator.binds.load(Ordering::SeqCst) >= 2);
    assert_eq!(mux.endpoints().resets(Domain::Sim), 1);
}

// ─── Binding ────────────────────────────────────────────────────────────────

struct FlakyLocator {
    inner: Arc<TestLocator>,
    failures_left: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
}

impl ServiceLocator for FlakyLocator {
    fn is_declared(&self, domain: Domain) -> bool {
        self.inner.is_declared(domain)
    }

    fn connect(
        &self,
        domain: Domain,
        version: HalVersion,
        hooks: LinkHooks,
    ) -> Result<Arc<dyn Connection>, BindError> {
        if domain == Domain::Sim {
            self.attempts.lock().unwrap().push(Instant::now());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BindError::Unavailable("service starting".into()));
            }
        }
        self.inner.connect(domain, version, hooks)
    }
}

#[test]
fn transient_bind_failure_is_retried_with_backoff() {
    init_tracing();
    let locator = Arc::new(FlakyLocator {
        inner: TestLocator::split(),
        failures_left: AtomicU32::new(2),
        attempts: Mutex::new(Vec::new()),
    });
    let mut config = MuxConfig::default();
    config.supervisor = SupervisorConfig {
        reset_policy: ResetPolicy::SingleDomain,
        retry_initial: Duration::from_millis(20),
        retry_max: Duration::from_millis(40),
    };
    let mux = RadioMux::builder(locator.clone()).config(config).build().unwrap();

    assert_eq!(mux.endpoint_state(Domain::Sim), EndpointState::Unbound);
    let completions = Completions::default();
    issue(&mux, Domain::Sim, RequestCode::GET_SIM_STATUS, &completions, 0);
    assert_eq!(completions.count(0), 1);
    assert!(mux.dispatcher().registry().is_empty());

    wait_until("sim bound", || mux.endpoint(Domain::Sim).is_bound());
    let attempts = locator.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(15));
    assert!(attempts[2] - attempts[1] >= Duration::from_millis(30));
}

/// Keeps the hooks of the first Sim bind attempt and fails it.
struct AbandoningLocator {
    inner: Arc<TestLocator>,
    abandoned: Mutex<Option<LinkHooks>>,
}

impl ServiceLocator for AbandoningLocator {
    fn is_declared(&self, domain: Domain) -> bool {
        self.inner.is_declared(domain)
    }

    fn connect(
        &self,
        domain: Domain,
        version: HalVersion,
        hooks: LinkHooks,
    ) -> Result<Arc<dyn Connection>, BindError> {
        if domain == Domain::Sim {
            let mut abandoned = self.abandoned.lock().unwrap();
            if abandoned.is_none() {
                *abandoned = Some(hooks);
                return Err(BindError::Unavailable("service starting".into()));
            }
        }
        self.inner.connect(domain, version, hooks)
    }
}

#[test]
fn hooks_from_failed_bind_attempt_are_stale() {
    init_tracing();
    let locator = Arc::new(AbandoningLocator {
        inner: TestLocator::split(),
        abandoned: Mutex::new(None),
    });
    let mut config = MuxConfig::default();
    config.supervisor = SupervisorConfig {
        reset_policy: ResetPolicy::SingleDomain,
        retry_initial: Duration::from_millis(10),
        retry_max: Duration::from_millis(20),
    };
    let mux = RadioMux::builder(locator.clone()).config(config).build().unwrap();
    wait_until("sim bound", || mux.endpoint(Domain::Sim).is_bound());

    let stale = locator.abandoned.lock().unwrap().clone().unwrap();
    assert_ne!(stale.origin().cookie, mux.endpoints().cookie(Domain::Sim));

    let completions = Completions::default();
    issue(&mux, Domain::Sim, RequestCode::GET_IMSI, &completions, 0);
    stale.sink.solicited(ResponseInfo::ok(Serial(1)), Bytes::from_static(b"imsi"));
    stale.death.notify();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(mux.endpoints().resets(Domain::Sim), 0);
    assert!(mux.endpoint(Domain::Sim).is_bound());
    assert_eq!(completions.count(0), 0);
    assert!(mux.dispatcher().registry().contains(Serial(1)));
}

#[test]
fn undeclared_and_configured_off_domains_are_disabled() {
    let locator = TestLocator::with(vec![Domain::Sim, Domain::Voice, Domain::Ims]);
    let config = MuxConfig::from_toml_str("disabled_domains = [\"ims\"]").unwrap();
    let mut mux = RadioMux::builder(locator).config(config).build().unwrap();

    assert!(mux.endpoint(Domain::Sim).is_bound());
    assert_eq!(mux.endpoint_state(Domain::Data), EndpointState::Disabled);
    assert_eq!(mux.endpoint_state(Domain::Ims), EndpointState::Disabled);
    assert_eq!(
        mux.endpoints().disabled_reason(Domain::Ims).as_deref(),
        Some("disabled by configuration")
    );

    mux.restart();
    assert_eq!(mux.endpoint_state(Domain::Ims), EndpointState::Disabled);
    // Re-probed on restart and disabled again.
    assert_eq!(mux.endpoint_state(Domain::Data), EndpointState::Disabled);
    mux.shutdown();
}

// ─── Restart & shutdown ─────────────────────────────────────────────────────

#[test]
fn restart_fails_pending_and_restarts_serials() {
    let locator = TestLocator::split();
    let mux = build(locator.clone(), ResetPolicy::AllNonLegacy);
    let completions = Completions::default();
    issue(&mux, Domain::Sim, RequestCode::GET_SIM_STATUS, &completions, 0);
    issue(&mux, Domain::Network, RequestCode::OPERATOR, &completions, 1);
    assert_eq!(mux.dispatcher().registry().serials(), vec![Serial(1), Serial(2)]);

    mux.restart();
    assert_eq!(completions.count(0), 1);
    assert_eq!(completions.count(1), 1);
    assert_eq!(mux.dispatcher().holds().work_count(), 0);
    assert!(mux.endpoint(Domain::Sim).is_bound());

    issue(&mux, Domain::Sim, RequestCode::GET_SIM_STATUS, &completions, 2);
    assert_eq!(mux.dispatcher().registry().serials(), vec![Serial(1)]);
    locator.respond(Serial(1), b"ok");
    assert_eq!(completions.count(2), 1);
}

#[test]
fn legacy_restart_reports_radio_unavailable() {
    let mux = build(TestLocator::legacy(), ResetPolicy::AllNonLegacy);
    let states = mux.events().subscribe_radio_state();
    mux.restart();
    assert_eq!(states.try_recv().unwrap(), RadioPowerState::Unavailable);
    assert_eq!(mux.events().radio_state(), RadioPowerState::Unavailable);
}

#[test]
fn shutdown_drains_and_is_idempotent() {
    let locator = TestLocator::split();
    let mut mux = build(locator, ResetPolicy::AllNonLegacy);
    let completions = Completions::default();
    issue(&mux, Domain::Voice, RequestCode::DIAL, &completions, 0);
    issue(&mux, Domain::Modem, RequestCode::GET_ACTIVITY_INFO, &completions, 1);

    mux.shutdown();
    mux.shutdown();
    assert_eq!(completions.count(0), 1);
    assert_eq!(completions.count(1), 1);
    assert!(mux.dispatcher().registry().is_empty());
    assert!(!mux.dispatcher().holds().is_work_held());

    issue(&mux, Domain::Voice, RequestCode::DIAL, &completions, 2);
    assert_eq!(completions.count(2), 1);
    assert_eq!(mux.endpoint_state(Domain::Voice), EndpointState::Unbound);
}

#[test]
fn blocking_call_times_out_with_default() {
    let mut config = MuxConfig::default();
    config.blocking_timeout = Duration::from_millis(30);
    let mux = RadioMux::builder(TestLocator::split())
        .config(config)
        .build()
        .unwrap();
    let (tx, rx) = unbounded();
    mux.call(
        &radiomux::command::GetActivityInfo,
        AttributionTag::default(),
        move |out| {
            let _ = tx.send(out);
        },
    );
    let info = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(info.synthesized);
    assert_eq!(info.sleep_ms, 0);
    assert!(mux.dispatcher().registry().is_empty());
}

#[test]
fn unknown_code_is_not_supported() {
    let mux = build(TestLocator::split(), ResetPolicy::AllNonLegacy);
    let (tx, rx) = unbounded();
    mux.issue(
        Domain::Sim,
        RequestCode(9_999),
        Bytes::new(),
        AttributionTag::default(),
        Box::new(move |out| {
            let _ = tx.send(out);
        }),
    );
    assert_eq!(rx.try_recv().unwrap(), Err(RequestError::NotSupported));
}

// ─── Configuration ──────────────────────────────────────────────────────────

#[test]
fn toml_config_is_applied_at_build() {
    let mux = RadioMux::builder(TestLocator::split())
        .config_toml(
            "[supervisor]\nreset_policy = \"single-domain\"\n\n[dispatch]\nblocking_timeout_ms = 250",
        )
        .build()
        .unwrap();
    assert_eq!(mux.supervisor().policy(), ResetPolicy::SingleDomain);
    assert_eq!(mux.dispatcher().blocking_timeout(), Duration::from_millis(250));
}

#[test]
fn invalid_toml_config_fails_build() {
    let Err(err) = RadioMux::builder(TestLocator::split())
        .config_toml("version = 2")
        .build()
    else {
        panic!("unsupported config version accepted");
    };
    assert!(matches!(err, MuxError::Config(ConfigError::UnsupportedVersion(2))));
}
