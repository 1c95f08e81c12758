//! # Telemetry
//!
//! Request latency and endpoint loss counters. The engine reports into a
//! [`TelemetrySink`] and only logs if the sink fails, so a broken sink can
//! never change an outcome.
//!
//! [`RequestHistograms`] is the built-in sink. Its latency buckets are
//! fixed: under 50 ms, 200 ms, 1 s, 5 s, and above.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::domain::Domain;
use crate::error::TelemetryError;
use crate::request::RequestCode;

/// Why an endpoint went through a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// The remote side died.
    ConnectionLost,
    /// A send or acknowledgment failed at the transport level.
    SendFailed,
    /// Dragged along by the reset policy when a sibling domain was lost.
    Sibling,
    /// Explicit reset request.
    Requested,
    /// Full subsystem restart.
    Restart,
}

impl LossReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LossReason::ConnectionLost => "connection_lost",
            LossReason::SendFailed => "send_failed",
            LossReason::Sibling => "sibling",
            LossReason::Requested => "requested",
            LossReason::Restart => "restart",
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record_latency(&self, code: RequestCode, latency: Duration) -> Result<(), TelemetryError>;

    fn record_loss(&self, domain: Domain, reason: LossReason) -> Result<(), TelemetryError>;

    /// A blocking call was answered with its synthesized default.
    fn record_timeout(&self, code: RequestCode) -> Result<(), TelemetryError>;
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_latency(&self, _: RequestCode, _: Duration) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn record_loss(&self, _: Domain, _: LossReason) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn record_timeout(&self, _: RequestCode) -> Result<(), TelemetryError> {
        Ok(())
    }
}

// ─── Histograms ─────────────────────────────────────────────────────────────

/// Upper bounds of the latency buckets in milliseconds; the last is open.
pub const BUCKET_BOUNDS_MS: [u64; 4] = [50, 200, 1_000, 5_000];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub buckets: [u64; 5],
    pub timeouts: u64,
}

impl LatencyStats {
    fn record(&mut self, ms: u64) {
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        self.max_ms = self.max_ms.max(ms);
        self.count += 1;
        self.total_ms += ms;
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms < *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct HistogramState {
    requests: BTreeMap<RequestCode, LatencyStats>,
    losses: BTreeMap<(Domain, LossReason), u64>,
}

/// In-memory sink keeping per-code latency histograms and loss counters.
#[derive(Default)]
pub struct RequestHistograms {
    state: Mutex<HistogramState>,
}

impl RequestHistograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, code: RequestCode) -> Option<LatencyStats> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .requests
            .get(&code)
            .cloned()
    }

    /// Resets recorded for `domain`, across all reasons.
    pub fn losses(&self, domain: Domain) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .losses
            .iter()
            .filter(|((d, _), _)| *d == domain)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Renders everything in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::with_capacity(1024);

        // ── Request latency ─────────────────────────────────────────

        let _ = writeln!(
            out,
            "# HELP radiomux_request_latency_ms Solicited request latency in milliseconds."
        );
        let _ = writeln!(out, "# TYPE radiomux_request_latency_ms histogram");
        for (code, stats) in &state.requests {
            let mut cumulative = 0;
            for (i, bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
                cumulative += stats.buckets[i];
                let _ = writeln!(
                    out,
                    "radiomux_request_latency_ms_bucket{{request=\"{code}\",le=\"{bound}\"}} {cumulative}"
                );
            }
            let _ = writeln!(
                out,
                "radiomux_request_latency_ms_bucket{{request=\"{code}\",le=\"+Inf\"}} {}",
                stats.count
            );
            let _ = writeln!(
                out,
                "radiomux_request_latency_ms_sum{{request=\"{code}\"}} {}",
                stats.total_ms
            );
            let _ = writeln!(
                out,
                "radiomux_request_latency_ms_count{{request=\"{code}\"}} {}",
                stats.count
            );
        }

        let _ = writeln!(
            out,
            "# HELP radiomux_blocking_timeouts_total Blocking calls answered with a default."
        );
        let _ = writeln!(out, "# TYPE radiomux_blocking_timeouts_total counter");
        for (code, stats) in state.requests.iter().filter(|(_, s)| s.timeouts > 0) {
            let _ = writeln!(
                out,
                "radiomux_blocking_timeouts_total{{request=\"{code}\"}} {}",
                stats.timeouts
            );
        }

        // ── Endpoint losses ─────────────────────────────────────────

        let _ = writeln!(
            out,
            "# HELP radiomux_endpoint_resets_total Endpoint resets by domain and reason."
        );
        let _ = writeln!(out, "# TYPE radiomux_endpoint_resets_total counter");
        for ((domain, reason), n) in &state.losses {
            let _ = writeln!(
                out,
                "radiomux_endpoint_resets_total{{domain=\"{domain}\",reason=\"{}\"}} {n}",
                reason.as_str()
            );
        }

        out
    }
}

impl TelemetrySink for RequestHistograms {
    fn record_latency(&self, code: RequestCode, latency: Duration) -> Result<(), TelemetryError> {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .requests
            .entry(code)
            .or_default()
            .record(ms);
        Ok(())
    }

    fn record_loss(&self, domain: Domain, reason: LossReason) -> Result<(), TelemetryError> {
        *self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .losses
            .entry((domain, reason))
            .or_insert(0) += 1;
        Ok(())
    }

    fn record_timeout(&self, code: RequestCode) -> Result<(), TelemetryError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .requests
            .entry(code)
            .or_default()
            .timeouts += 1;
        Ok(())
    }
}
