#![forbid(unsafe_code)]

use std::env;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use unread_sim::campaign::{CampaignConfig, replay_seed, run_campaign};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Seeded simulation campaigns for unread marker compaction",
    long_about = None
)]
struct Cli {
    /// First seed to run.
    #[arg(long, default_value_t = 0)]
    start_seed: u64,

    /// Number of seeds to run.
    #[arg(long, default_value_t = 50)]
    seeds: u64,

    /// Readers per simulation.
    #[arg(long, default_value_t = 4)]
    readers: usize,

    /// Items in the simulated collection.
    #[arg(long, default_value_t = 24)]
    items: usize,

    /// Steps per simulation.
    #[arg(long, default_value_t = 200)]
    steps: u64,

    /// Distance between the oldest unread key and the compacted baseline.
    #[arg(long, default_value_t = 1)]
    baseline_gap_us: i64,

    /// Replay a single seed and print its full trace.
    #[arg(long)]
    replay: Option<u64>,
}

impl Cli {
    fn campaign(&self) -> CampaignConfig {
        CampaignConfig {
            seed_range: self.start_seed..self.start_seed.saturating_add(self.seeds),
            readers: self.readers,
            items: self.items,
            steps: self.steps,
            baseline_gap_us: self.baseline_gap_us,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("UNREAD_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "unread=debug,info"
        } else {
            "unread=info,warn"
        })
    });

    let format = env::var("UNREAD_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let campaign = cli.campaign();

    if let Some(seed) = cli.replay {
        let result = replay_seed(&campaign, seed)?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        println!("{}", serde_json::to_string_pretty(&result.trace)?);
        return Ok(if result.passed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    info!(seeds = cli.seeds, start_seed = cli.start_seed, "starting campaign");
    let report = run_campaign(&campaign)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
