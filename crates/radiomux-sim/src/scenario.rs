use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use radiomux::{
    AttributionTag, Domain, EventCode, IndicationKind, MuxConfig, MuxError, RadioError,
    RadioMux, RequestCode, RequestError, ResetPolicy,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::modem::{MockModem, ResponseMode};

/// Parameters of one seeded chaos run.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub seed: u64,
    pub steps: u32,
    pub policy: ResetPolicy,
    /// Run against a legacy-only modem instead of split services.
    pub legacy: bool,
    pub blocking_timeout: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            seed: 1,
            steps: 500,
            policy: ResetPolicy::AllNonLegacy,
            legacy: false,
            blocking_timeout: Duration::from_millis(20),
        }
    }
}

/// How issued requests ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub ok: u64,
    pub synthesized: u64,
    pub unavailable: u64,
    pub not_supported: u64,
    pub radio_error: u64,
    pub other: u64,
}

/// Summary of one run. Clean when every request completed exactly once
/// and no work hold outlived shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub seed: u64,
    pub steps: u32,
    pub policy: ResetPolicy,
    pub issued: u64,
    pub completed: u64,
    /// Requests whose continuation ran more than once.
    pub duplicates: u64,
    /// Requests whose continuation never ran.
    pub missing: u64,
    pub outstanding_holds: u32,
    pub kills: u64,
    pub restarts: u64,
    pub outcomes: OutcomeCounts,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.duplicates == 0 && self.missing == 0 && self.outstanding_holds == 0
    }
}

#[derive(Default)]
struct Ledger {
    counts: HashMap<u64, u32>,
    outcomes: OutcomeCounts,
}

const SPLIT_REQUESTS: [(Domain, RequestCode); 9] = [
    (Domain::Sim, RequestCode::GET_SIM_STATUS),
    (Domain::Sim, RequestCode::GET_IMSI),
    (Domain::Voice, RequestCode::GET_CURRENT_CALLS),
    (Domain::Voice, RequestCode::DIAL),
    (Domain::Network, RequestCode::OPERATOR),
    (Domain::Network, RequestCode::IS_N1_MODE_ENABLED),
    (Domain::Data, RequestCode::SETUP_DATA_CALL),
    (Domain::Messaging, RequestCode::SEND_SMS),
    (Domain::Modem, RequestCode::GET_ACTIVITY_INFO),
];

/// Replays a seeded sequence of requests, answers and faults against a
/// [`MockModem`], then shuts down and audits every continuation.
pub fn run(cfg: &ScenarioConfig) -> Result<Report, MuxError> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let modem = if cfg.legacy {
        MockModem::legacy()
    } else {
        MockModem::split()
    };
    modem.set_mode(
        Domain::Network,
        ResponseMode::AutoRespond {
            latency: Duration::from_millis(1),
        },
    );

    let mut config = MuxConfig::default();
    config.supervisor.reset_policy = cfg.policy;
    config.supervisor.retry_initial = Duration::from_millis(2);
    config.supervisor.retry_max = Duration::from_millis(10);
    config.blocking_timeout = cfg.blocking_timeout;
    let mut mux = RadioMux::builder(modem.clone()).config(config).build()?;

    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let mut issued = 0u64;
    let mut kills = 0u64;
    let mut restarts = 0u64;

    for _ in 0..cfg.steps {
        let pending = mux.dispatcher().registry().serials();
        let roll = rng.random_range(0..100u32);
        match roll {
            0..=39 => {
                let (domain, code) = SPLIT_REQUESTS[rng.random_range(0..SPLIT_REQUESTS.len())];
                mux.issue(
                    domain,
                    code,
                    Bytes::from_static(b"chaos"),
                    AttributionTag::new("chaos"),
                    completion(&ledger, issued),
                );
                issued += 1;
            }
            40..=64 if !pending.is_empty() => {
                let serial = pending[rng.random_range(0..pending.len())];
                if rng.random::<f64>() < 0.1 {
                    modem.respond_error(serial, RadioError::GENERIC_FAILURE);
                } else {
                    modem.respond(serial, Bytes::from_static(b"ok"));
                }
            }
            65..=74 if !pending.is_empty() => {
                modem.ack(pending[rng.random_range(0..pending.len())]);
            }
            75..=79 => {
                let domain = Domain::ALL[rng.random_range(0..Domain::COUNT)];
                modem.indicate(
                    domain,
                    IndicationKind::UnsolicitedAckExpected,
                    EventCode::SIGNAL_STRENGTH,
                    Bytes::from_static(b"-85"),
                );
            }
            80..=85 => {
                let domain = Domain::ALL[rng.random_range(0..Domain::COUNT)];
                if rng.random::<bool>() {
                    modem.fail_binds(domain, rng.random_range(1..3));
                }
                if modem.kill(domain) {
                    kills += 1;
                }
            }
            86..=88 => {
                let domain = Domain::ALL[rng.random_range(0..Domain::COUNT)];
                modem.kill_stale(domain);
            }
            89..=92 => {
                let domain = Domain::ALL[rng.random_range(0..Domain::COUNT)];
                if rng.random::<bool>() {
                    modem.fail_sends(domain, 1);
                } else {
                    modem.reject_sends(domain, 1);
                }
            }
            93 => {
                kills += modem.kill_all_non_legacy() as u64;
            }
            94 => {
                mux.restart();
                restarts += 1;
            }
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }

    // Let in-flight auto responses and blocking deadlines land before
    // tearing down, so the report reflects more than drains.
    let settle = Instant::now() + cfg.blocking_timeout * 2;
    while Instant::now() < settle && !mux.dispatcher().registry().is_empty() {
        thread::sleep(Duration::from_millis(2));
    }
    // Drain before shutdown: shutdown clears the hold count itself, and a
    // hold left over here means a record leaked its ticket.
    mux.dispatcher().drain_all();
    let outstanding_holds = mux.dispatcher().holds().work_count();
    mux.shutdown();

    let ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
    let completed: u64 = ledger.counts.values().map(|n| u64::from(*n)).sum();
    let duplicates = ledger.counts.values().filter(|n| **n > 1).count() as u64;
    let missing = (0..issued).filter(|id| !ledger.counts.contains_key(id)).count() as u64;

    let report = Report {
        seed: cfg.seed,
        steps: cfg.steps,
        policy: cfg.policy,
        issued,
        completed,
        duplicates,
        missing,
        outstanding_holds,
        kills,
        restarts,
        outcomes: ledger.outcomes.clone(),
    };
    info!(
        seed = report.seed,
        issued = report.issued,
        duplicates = report.duplicates,
        missing = report.missing,
        clean = report.is_clean(),
        "scenario finished"
    );
    Ok(report)
}

fn completion(ledger: &Arc<Mutex<Ledger>>, id: u64) -> radiomux::request::Completion {
    let ledger = ledger.clone();
    Box::new(move |outcome| {
        let mut ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
        *ledger.counts.entry(id).or_insert(0) += 1;
        let o = &mut ledger.outcomes;
        match outcome {
            Ok(r) if r.synthesized => o.synthesized += 1,
            Ok(_) => o.ok += 1,
            Err(RequestError::ServiceUnavailable) => o.unavailable += 1,
            Err(RequestError::NotSupported) => o.not_supported += 1,
            Err(RequestError::Radio(_)) => o.radio_error += 1,
            Err(e) => {
                debug!(request = id, error = %e, "unexpected outcome");
                o.other += 1;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_run_is_clean() {
        let report = run(&ScenarioConfig {
            seed: 42,
            steps: 200,
            ..Default::default()
        })
        .unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.completed, report.issued);
        assert!(report.issued > 0);
    }

    #[test]
    fn report_serializes_policy_name() {
        let report = run(&ScenarioConfig {
            seed: 7,
            steps: 20,
            policy: ResetPolicy::SingleDomain,
            ..Default::default()
        })
        .unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["policy"], "single-domain");
        assert_eq!(json["seed"], 7);
    }
}
