//! unread-sim library.
//!
//! Drives seeded random workloads (marks, edits, mark-all, resets,
//! compactions) against a real [`ReadState`] on an in-memory database and
//! checks every answer against [`oracle::ModelState`].
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod campaign;
pub mod oracle;
pub mod rng;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use unread_core::config::{StoreConfig, UnreadConfig};
use unread_core::db::markers::{self, MarkerStats};
use unread_core::db::open_in_memory;
use unread_core::{Clock, ItemSource, ManualClock, ReadState, ReadableItem, Reader, StaticReaders};

use crate::oracle::{InvariantViolation, ModelState, OracleResult};
use crate::rng::DeterministicRng;

/// Collection every simulation runs against.
pub const COLLECTION: &str = "Item";

/// Simulated clock start; initial read keys fall below it.
pub const START_US: i64 = 1_700_000_000_000_000;

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub readers: usize,
    pub items: usize,
    pub steps: u64,
    /// Clock advance per step.
    pub step_us: i64,
    pub baseline_gap_us: i64,
    /// Action mix in percent; whatever is left over after these is a mark.
    pub compact_percent: u8,
    pub touch_percent: u8,
    pub mark_all_percent: u8,
    pub reset_percent: u8,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            readers: 4,
            items: 24,
            steps: 200,
            step_us: 1_000,
            baseline_gap_us: 1,
            compact_percent: 15,
            touch_percent: 15,
            mark_all_percent: 4,
            reset_percent: 1,
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if a count is zero or the action mix exceeds 100%.
    pub fn validate(&self) -> Result<()> {
        if self.readers == 0 {
            bail!("readers must be > 0");
        }
        if self.items == 0 {
            bail!("items must be > 0");
        }
        if self.step_us <= 0 {
            bail!("step_us must be > 0");
        }
        if self.baseline_gap_us < 1 {
            bail!("baseline_gap_us must be >= 1");
        }
        let mix = u16::from(self.compact_percent)
            + u16::from(self.touch_percent)
            + u16::from(self.mark_all_percent)
            + u16::from(self.reset_percent);
        if mix > 100 {
            bail!("action mix adds up to {mix}%, must be <= 100%");
        }
        Ok(())
    }
}

/// One applied step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SimEvent {
    Mark { reader: i64, items: Vec<usize>, written: usize },
    Touch { item: usize, read_key: i64 },
    MarkAll { reader: i64 },
    ResetAll,
    Compact { markers_deleted: u64 },
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub steps: u64,
    pub compactions: u64,
    pub markers_deleted: u64,
    pub final_stats: MarkerStats,
    pub violations: Vec<InvariantViolation>,
    #[serde(skip)]
    pub trace: Vec<SimEvent>,
}

impl SimulationResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A seeded workload bound to its own database.
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    conn: Connection,
    state: ReadState,
    clock: Arc<ManualClock>,
    model: ModelState,
    reader_ids: Vec<i64>,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the database cannot be
    /// prepared.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = DeterministicRng::new(config.seed);

        let conn = open_in_memory(&StoreConfig::default()).context("open simulation store")?;
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, updated_at_us INTEGER NOT NULL);",
        )
        .context("create item table")?;

        // Initial keys spread over as much history as the run will add.
        let span = config
            .steps
            .saturating_add(1)
            .saturating_mul(u64::try_from(config.step_us).unwrap_or(1));
        let mut keys = Vec::with_capacity(config.items);
        for id in 1..=config.items {
            let back = i64::try_from(rng.below(span)).unwrap_or_default() + 1;
            let key = START_US - back;
            conn.execute(
                "INSERT INTO items (id, updated_at_us) VALUES (?1, ?2)",
                params![i64::try_from(id)?, key],
            )
            .context("seed items")?;
            keys.push(key);
        }

        let reader_ids: Vec<i64> = (1..=i64::try_from(config.readers)?).collect();
        let clock = Arc::new(ManualClock::new(START_US));
        let mut engine_config = UnreadConfig::default();
        engine_config.compaction.baseline_gap_us = config.baseline_gap_us;

        let state = ReadState::builder()
            .collection(ItemSource::new(COLLECTION, "items", "id", "updated_at_us")?)?
            .readers(StaticReaders::new(reader_ids.iter().copied()))
            .clock(clock.clone())
            .config(engine_config)
            .build()?;

        Ok(Self {
            model: ModelState::new(&reader_ids, keys),
            config,
            rng,
            conn,
            state,
            clock,
            reader_ids,
        })
    }

    /// Run every step, checking the oracle after each compaction and once at
    /// the end.
    ///
    /// # Errors
    ///
    /// Returns an error if an engine call fails outside of compaction.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let mut trace = Vec::new();
        let mut oracle = OracleResult::default();
        let mut compactions = 0;
        let mut markers_deleted = 0;

        for step in 0..self.config.steps {
            self.clock.advance(self.config.step_us);
            let event = self.step(step, &mut oracle)?;
            if let SimEvent::Compact {
                markers_deleted: deleted,
            } = &event
            {
                compactions += 1;
                markers_deleted += deleted;
            }
            debug!(seed = self.config.seed, step, ?event, "simulation step");
            trace.push(event);
        }
        oracle.extend(self.check(self.config.steps)?);

        let final_stats = self.state.marker_stats(&self.conn, COLLECTION)?;
        info!(
            seed = self.config.seed,
            steps = self.config.steps,
            compactions,
            markers_deleted,
            passed = oracle.passed(),
            violations = oracle.violations.len(),
            "simulation finished"
        );

        Ok(SimulationResult {
            seed: self.config.seed,
            steps: self.config.steps,
            compactions,
            markers_deleted,
            final_stats,
            violations: oracle.violations,
            trace,
        })
    }

    fn step(&mut self, step: u64, oracle: &mut OracleResult) -> Result<SimEvent> {
        let roll = self.rng.below(100);
        let compact = u64::from(self.config.compact_percent);
        let touch = compact + u64::from(self.config.touch_percent);
        let mark_all = touch + u64::from(self.config.mark_all_percent);
        let reset = mark_all + u64::from(self.config.reset_percent);

        let event = if roll < compact {
            self.compact(step, oracle)?
        } else if roll < touch {
            let item = self.rng.index(self.config.items);
            let read_key = self.clock.now_us();
            self.conn.execute(
                "UPDATE items SET updated_at_us = ?1 WHERE id = ?2",
                params![read_key, i64::try_from(item)? + 1],
            )?;
            self.model.touch(item, read_key);
            SimEvent::Touch { item, read_key }
        } else if roll < mark_all {
            let reader = self.reader_ids[self.rng.index(self.reader_ids.len())];
            self.state
                .mark_all_read(&self.conn, &Reader::new(reader), COLLECTION)?;
            self.model.mark_all(reader, self.clock.now_us());
            SimEvent::MarkAll { reader }
        } else if roll < reset {
            self.state.reset_all(&self.conn, COLLECTION)?;
            self.model.reset_all(self.clock.now_us());
            SimEvent::ResetAll
        } else {
            let reader = self.reader_ids[self.rng.index(self.reader_ids.len())];
            let count = 1 + self.rng.index(3);
            let items: Vec<usize> = (0..count).map(|_| self.rng.index(self.config.items)).collect();
            let batch: Vec<ReadableItem> = items.iter().map(|idx| self.item(*idx)).collect();
            let written = self
                .state
                .mark_read(&self.conn, &Reader::new(reader), &batch, COLLECTION)?;
            self.model.mark(reader, &items);
            SimEvent::Mark {
                reader,
                items,
                written,
            }
        };
        Ok(event)
    }

    fn compact(&self, step: u64, oracle: &mut OracleResult) -> Result<SimEvent> {
        let report = self.state.compact_all(&self.conn, COLLECTION)?;
        for failure in &report.failures {
            oracle.push(InvariantViolation::CompactionFailed {
                step,
                reader: failure.reader_id.get(),
                message: failure.message.clone(),
            });
        }

        for reader in &self.reader_ids {
            let reader_id = Reader::new(*reader).id;
            let Some(global) = markers::find(&self.conn, reader_id, COLLECTION, None)? else {
                continue;
            };
            for marker in markers::list_for_reader(&self.conn, reader_id, COLLECTION)? {
                if !marker.is_global() && marker.read_at_us <= global.read_at_us {
                    oracle.push(InvariantViolation::MarkerBelowBaseline {
                        step,
                        reader: *reader,
                        read_at_us: marker.read_at_us,
                        baseline_us: global.read_at_us,
                    });
                }
            }
        }

        oracle.extend(self.check(step)?);
        Ok(SimEvent::Compact {
            markers_deleted: report.markers_deleted,
        })
    }

    /// Compare engine answers, on both query paths, with the model.
    fn check(&self, step: u64) -> Result<OracleResult> {
        let mut result = OracleResult::default();
        let mut model_counts: BTreeMap<i64, u64> = BTreeMap::new();
        for (reader, _) in self.model.unread_pairs() {
            *model_counts.entry(reader).or_default() += 1;
        }

        for reader_id in &self.reader_ids {
            let reader = Reader::new(*reader_id);
            let query = self.state.list_unread(&self.conn, &reader, COLLECTION)?;
            let listed: BTreeSet<String> = query
                .items(&self.conn)?
                .into_iter()
                .map(|item| item.item_id)
                .collect();

            let model = model_counts.get(reader_id).copied().unwrap_or_default();
            let engine = query.count(&self.conn)?;
            if model != engine {
                result.push(InvariantViolation::UnreadCountMismatch {
                    step,
                    reader: *reader_id,
                    model,
                    engine,
                });
            }

            for idx in 0..self.model.keys().len() {
                let item = self.item(idx);
                let engine_unread = self.state.is_unread(&self.conn, &reader, &item)?;
                let model_unread = self.model.is_unread(*reader_id, idx);
                if engine_unread != model_unread {
                    result.push(InvariantViolation::ModelDivergence {
                        step,
                        reader: *reader_id,
                        item: idx,
                        model_unread,
                        engine_unread,
                    });
                }
                let listed_unread = listed.contains(&item.item_id);
                if listed_unread != engine_unread {
                    result.push(InvariantViolation::PathDisagreement {
                        step,
                        reader: *reader_id,
                        item: idx,
                        direct_unread: engine_unread,
                        listed_unread,
                    });
                }
            }
        }
        Ok(result)
    }

    fn item(&self, idx: usize) -> ReadableItem {
        ReadableItem::new(COLLECTION, (idx + 1).to_string(), self.model.keys()[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_passes() {
        let mut sim = Simulator::new(SimulationConfig::default()).expect("simulator");
        let result = sim.run().expect("run");
        assert!(result.passed(), "violations: {:?}", result.violations);
        assert_eq!(result.trace.len(), 200);
    }

    #[test]
    fn same_seed_same_trace() {
        let config = SimulationConfig {
            seed: 99,
            steps: 80,
            ..SimulationConfig::default()
        };
        let a = Simulator::new(config.clone()).expect("a").run().expect("run a");
        let b = Simulator::new(config).expect("b").run().expect("run b");
        assert_eq!(a.trace, b.trace);
        assert_eq!(a.final_stats, b.final_stats);
    }

    #[test]
    fn invalid_mix_is_rejected() {
        let config = SimulationConfig {
            compact_percent: 60,
            touch_percent: 60,
            ..SimulationConfig::default()
        };
        assert!(Simulator::new(config).is_err());
    }
}
