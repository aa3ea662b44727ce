//! Reference model and invariant checks.
//!
//! The model is the read-state semantics with no storage tricks: a map of
//! item markers and an optional baseline per reader. Compaction never touches
//! it, so any disagreement after a compaction step means compaction changed
//! an observable answer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ReaderModel {
    baseline_us: Option<i64>,
    item_markers: BTreeMap<usize, i64>,
}

/// In-memory mirror of every reader's read state over one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelState {
    keys: Vec<i64>,
    readers: BTreeMap<i64, ReaderModel>,
}

impl ModelState {
    #[must_use]
    pub fn new(reader_ids: &[i64], keys: Vec<i64>) -> Self {
        Self {
            keys,
            readers: reader_ids
                .iter()
                .map(|id| (*id, ReaderModel::default()))
                .collect(),
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[i64] {
        &self.keys
    }

    pub fn touch(&mut self, item: usize, key: i64) {
        if let Some(slot) = self.keys.get_mut(item) {
            *slot = key;
        }
    }

    #[must_use]
    pub fn is_unread(&self, reader: i64, item: usize) -> bool {
        let Some(state) = self.readers.get(&reader) else {
            return true;
        };
        let key = self.keys[item];
        if state.item_markers.get(&item).is_some_and(|read_at| *read_at >= key) {
            return false;
        }
        state.baseline_us.is_none_or(|baseline| key > baseline)
    }

    pub fn mark(&mut self, reader: i64, items: &[usize]) {
        for item in items {
            if self.is_unread(reader, *item) {
                let key = self.keys[*item];
                if let Some(state) = self.readers.get_mut(&reader) {
                    state.item_markers.insert(*item, key);
                }
            }
        }
    }

    pub fn mark_all(&mut self, reader: i64, now_us: i64) {
        if let Some(state) = self.readers.get_mut(&reader) {
            state.item_markers.clear();
            state.baseline_us = Some(now_us);
        }
    }

    pub fn reset_all(&mut self, now_us: i64) {
        for state in self.readers.values_mut() {
            state.item_markers.clear();
            state.baseline_us = Some(now_us);
        }
    }

    /// Every (reader, item) pair the model considers unread.
    #[must_use]
    pub fn unread_pairs(&self) -> Vec<(i64, usize)> {
        self.readers
            .keys()
            .flat_map(|reader| {
                (0..self.keys.len())
                    .filter(move |item| self.is_unread(*reader, *item))
                    .map(move |item| (*reader, item))
            })
            .collect()
    }
}

// ── Violations ───────────────────────────────────────────────────────────────

/// One failed invariant, with enough context to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvariantViolation {
    /// Engine and model disagree on one item.
    ModelDivergence {
        step: u64,
        reader: i64,
        item: usize,
        model_unread: bool,
        engine_unread: bool,
    },
    /// The point-lookup and set-based paths disagree.
    PathDisagreement {
        step: u64,
        reader: i64,
        item: usize,
        direct_unread: bool,
        listed_unread: bool,
    },
    /// An item marker at or below the baseline survived compaction.
    MarkerBelowBaseline {
        step: u64,
        reader: i64,
        read_at_us: i64,
        baseline_us: i64,
    },
    /// Compaction returned an error for a valid reader.
    CompactionFailed { step: u64, reader: i64, message: String },
    /// The engine's unread count differs from the model's.
    UnreadCountMismatch {
        step: u64,
        reader: i64,
        model: u64,
        engine: u64,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelDivergence {
                step,
                reader,
                item,
                model_unread,
                engine_unread,
            } => write!(
                f,
                "step {step}: reader {reader} item {item}: model unread={model_unread}, engine unread={engine_unread}"
            ),
            Self::PathDisagreement {
                step,
                reader,
                item,
                direct_unread,
                listed_unread,
            } => write!(
                f,
                "step {step}: reader {reader} item {item}: is_unread={direct_unread}, list_unread={listed_unread}"
            ),
            Self::MarkerBelowBaseline {
                step,
                reader,
                read_at_us,
                baseline_us,
            } => write!(
                f,
                "step {step}: reader {reader} kept item marker at {read_at_us} <= baseline {baseline_us}"
            ),
            Self::CompactionFailed {
                step,
                reader,
                message,
            } => write!(f, "step {step}: compaction failed for reader {reader}: {message}"),
            Self::UnreadCountMismatch {
                step,
                reader,
                model,
                engine,
            } => write!(
                f,
                "step {step}: reader {reader} has {engine} unread, model expects {model}"
            ),
        }
    }
}

/// Outcome of one oracle pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleResult {
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn push(&mut self, violation: InvariantViolation) {
        self.violations.push(violation);
    }

    pub fn extend(&mut self, other: Self) {
        self.violations.extend(other.violations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_follows_read_semantics() {
        let mut model = ModelState::new(&[1, 2], vec![10, 20, 30]);
        assert!(model.is_unread(1, 0));

        model.mark(1, &[0, 1]);
        assert!(!model.is_unread(1, 0));
        assert!(model.is_unread(2, 0));

        model.touch(1, 25);
        assert!(model.is_unread(1, 1), "edited item is unread again");

        model.mark_all(2, 100);
        assert!(model.unread_pairs().iter().all(|(reader, _)| *reader == 1));

        model.reset_all(100);
        assert!(model.unread_pairs().is_empty());
        model.touch(2, 101);
        assert_eq!(model.unread_pairs(), vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn oracle_result_fails_once_a_violation_is_pushed() {
        let mut result = OracleResult::default();
        assert!(result.passed());
        result.push(InvariantViolation::UnreadCountMismatch {
            step: 1,
            reader: 2,
            model: 3,
            engine: 4,
        });
        assert!(!result.passed());
        assert!(result.violations[0].to_string().contains("4 unread"));
    }

    #[test]
    fn violations_render_step_and_reader() {
        let violation = InvariantViolation::MarkerBelowBaseline {
            step: 3,
            reader: 7,
            read_at_us: 10,
            baseline_us: 12,
        };
        let text = violation.to_string();
        assert!(text.contains("step 3"));
        assert!(text.contains("reader 7"));
    }
}
