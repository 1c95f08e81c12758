//! Issue-to-completion latency benchmarks for radiomux.
//!
//! Measures the request path in isolation from any real codec:
//! - issue + in-line response over a loopback connection
//! - request ack followed by the response
//! - compatibility gate lookups
//! - domain drain of a populated registry
//!
//! Run with: cargo bench --package radiomux

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use radiomux::{
    AttributionTag, BindError, Connection, Domain, HalVersion, LinkHooks, MuxConfig,
    OutboundRequest, RadioMux, RequestCode, ResponseInfo, ResponseKind, SendError, Serial,
    ServiceLocator,
};

// ─── Loopback transport ─────────────────────────────────────────────────

/// Answers every request before `send` returns, optionally preceded by a
/// request ack.
struct Loopback {
    hooks: LinkHooks,
    ack_first: bool,
    answer: bool,
}

impl Connection for Loopback {
    fn send(&self, request: &OutboundRequest) -> Result<(), SendError> {
        if self.ack_first {
            self.hooks.sink.solicited(
                ResponseInfo::ok(request.serial).with_kind(ResponseKind::SolicitedAck),
                Bytes::new(),
            );
        }
        if self.answer {
            self.hooks
                .sink
                .solicited(ResponseInfo::ok(request.serial), Bytes::from_static(b"ok"));
        }
        Ok(())
    }

    fn send_ack(&self) -> Result<(), SendError> {
        Ok(())
    }
}

struct LoopbackLocator {
    ack_first: bool,
    answer: bool,
}

impl ServiceLocator for LoopbackLocator {
    fn is_declared(&self, domain: Domain) -> bool {
        !domain.is_legacy()
    }

    fn connect(
        &self,
        _: Domain,
        _: HalVersion,
        hooks: LinkHooks,
    ) -> Result<Arc<dyn Connection>, BindError> {
        Ok(Arc::new(Loopback {
            hooks,
            ack_first: self.ack_first,
            answer: self.answer,
        }))
    }
}

fn mux(ack_first: bool, answer: bool) -> RadioMux {
    let locator = Arc::new(LoopbackLocator {
        ack_first,
        answer,
    });
    RadioMux::builder(locator)
        .config(MuxConfig::default())
        .build()
        .unwrap()
}

fn issue(mux: &RadioMux, domain: Domain, code: RequestCode, tag: &AttributionTag) {
    mux.issue(
        domain,
        code,
        Bytes::from_static(b"args"),
        tag.clone(),
        Box::new(|outcome| {
            black_box(outcome.is_ok());
        }),
    );
}

// ─── Request path ───────────────────────────────────────────────────────

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));
    let tag = AttributionTag::new("bench");

    let direct = mux(false, true);
    group.bench_function("issue_respond", |b| {
        b.iter(|| issue(&direct, Domain::Sim, RequestCode::GET_SIM_STATUS, &tag));
    });

    let acked = mux(true, true);
    group.bench_function("issue_ack_respond", |b| {
        b.iter(|| issue(&acked, Domain::Messaging, RequestCode::SEND_SMS, &tag));
    });

    group.finish();
}

fn bench_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("compat_gate");
    let mux = mux(false, true);
    let gate = mux.dispatcher().gate();

    group.bench_function("admit", |b| {
        b.iter(|| {
            black_box(
                gate.check(
                    black_box(RequestCode::OPERATOR),
                    Domain::Network,
                    HalVersion::V2_2,
                )
                .is_ok(),
            )
        });
    });
    group.bench_function("reject_version", |b| {
        b.iter(|| {
            black_box(
                gate.check(
                    black_box(RequestCode::IS_N1_MODE_ENABLED),
                    Domain::Network,
                    HalVersion::V2_0,
                )
                .is_err(),
            )
        });
    });

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_domain");
    let tag = AttributionTag::new("bench");

    for pending in [16usize, 256] {
        group.throughput(Throughput::Elements(pending as u64));
        let mux = mux(false, false);
        group.bench_function(format!("{pending}_pending"), |b| {
            b.iter(|| {
                for _ in 0..pending {
                    issue(&mux, Domain::Voice, RequestCode::GET_CURRENT_CALLS, &tag);
                }
                black_box(mux.dispatcher().drain_domain(Domain::Voice))
            });
        });
    }

    group.finish();
}

fn bench_serials(c: &mut Criterion) {
    let mux = mux(false, false);
    c.bench_function("serial_next", |b| {
        b.iter(|| black_box::<Serial>(mux.dispatcher().serials().next()));
    });
}

criterion_group!(benches, bench_round_trip, bench_gate, bench_drain, bench_serials);
criterion_main!(benches);
