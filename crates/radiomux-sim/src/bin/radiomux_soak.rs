use anyhow::{bail, Result};
use clap::Parser;
use radiomux::ResetPolicy;
use radiomux_sim::scenario::{self, ScenarioConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "radiomux-soak", about = "Seeded chaos soak for the radio multiplexer")]
struct Cli {
    /// First seed; run `i` uses `seed + i`.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Number of seeds to run.
    #[arg(long, default_value_t = 10)]
    runs: u64,

    /// Steps per run.
    #[arg(long, default_value_t = 2_000)]
    steps: u32,

    /// Reset policy: `single-domain` or `all-non-legacy`.
    #[arg(long, default_value = "all-non-legacy")]
    policy: ResetPolicy,

    /// Simulate a legacy-only modem.
    #[arg(long, default_value_t = false)]
    legacy: bool,

    /// Blocking call timeout in milliseconds.
    #[arg(long, default_value_t = 20)]
    blocking_timeout_ms: u64,

    /// Print one JSON report per run instead of a summary line.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut failed = Vec::new();

    for i in 0..cli.runs {
        let cfg = ScenarioConfig {
            seed: cli.seed + i,
            steps: cli.steps,
            policy: cli.policy,
            legacy: cli.legacy,
            blocking_timeout: Duration::from_millis(cli.blocking_timeout_ms),
        };
        let report = scenario::run(&cfg)?;
        if cli.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!(
                "seed={} issued={} completed={} duplicates={} missing={} holds={} kills={} restarts={}",
                report.seed,
                report.issued,
                report.completed,
                report.duplicates,
                report.missing,
                report.outstanding_holds,
                report.kills,
                report.restarts,
            );
        }
        if !report.is_clean() {
            failed.push(report.seed);
        }
    }

    if !failed.is_empty() {
        bail!("exactly-once violated for seeds {failed:?}");
    }
    Ok(())
}
