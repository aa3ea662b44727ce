//! Seed campaigns: run many simulations and keep the failing seeds for
//! replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign-level parameters; every seed in `seed_range` gets the same
/// workload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    pub readers: usize,
    pub items: usize,
    pub steps: u64,
    pub baseline_gap_us: i64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let base = SimulationConfig::default();
        Self {
            seed_range: 0..50,
            readers: base.readers,
            items: base.items,
            steps: base.steps,
            baseline_gap_us: base.baseline_gap_us,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            readers: self.readers,
            items: self.items,
            steps: self.steps,
            baseline_gap_us: self.baseline_gap_us,
            ..SimulationConfig::default()
        }
    }

    /// # Errors
    ///
    /// Returns an error if the seed range is empty or the per-seed config is
    /// invalid.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// Lowest failing seed, the first one to replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    pub compactions: u64,
    pub markers_deleted: u64,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every seed in the campaign.
///
/// # Errors
///
/// Returns an error if the config is invalid or a simulation hits an engine
/// error (as opposed to an invariant violation, which is reported).
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;
    let mut report = CampaignReport::default();

    for seed in config.seed_range.clone() {
        let result = replay_seed(config, seed)?;
        report.seeds_run += 1;
        report.compactions += result.compactions;
        report.markers_deleted += result.markers_deleted;

        if result.passed() {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = result.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: result.violations.iter().map(ToString::to_string).collect(),
            });
        }
    }

    info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        markers_deleted = report.markers_deleted,
        "campaign finished"
    );
    Ok(report)
}

/// Re-run one seed with the campaign's parameters, keeping the full trace.
///
/// # Errors
///
/// Returns an error if the simulation cannot be built or run.
pub fn replay_seed(config: &CampaignConfig, seed: u64) -> Result<SimulationResult> {
    Simulator::new(config.sim_config_for_seed(seed))?.run()
}
