/*!
Per-symbol training status tracking.

A symbol moves from `training` to either `completed` or `failed`; it can only start training again
once it has left the `training` state. While a symbol's model is being deleted it cannot start
training, and a training symbol cannot be deleted.
*/
use crate::error::{Error, Result};
use crate::evaluate::Metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Progress milestones of a training run, in percent
pub mod progress {
    /// Job accepted
    pub const STARTED: u8 = 0;
    /// Data fetched
    pub const FETCHED: u8 = 10;
    /// Features engineered
    pub const FEATURES: u8 = 25;
    /// Sequences built
    pub const PREPARED: u8 = 40;
    /// Model built
    pub const MODEL_BUILT: u8 = 50;
    /// Training started
    pub const TRAINING: u8 = 60;
    /// Training finished, evaluating
    pub const EVALUATING: u8 = 90;
    /// Artifacts saved
    pub const COMPLETED: u8 = 100;

    /// Progress after `epoch` of `epochs`, spread between `TRAINING` and `EVALUATING`
    pub fn epoch(epoch: usize, epochs: usize) -> u8 {
        if epochs == 0 {
            return TRAINING;
        }
        let span = (EVALUATING - TRAINING) as usize;
        TRAINING + (span * epoch.min(epochs) / epochs) as u8
    }
}

/// The state of a training run
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingState {
    /// Currently running
    Training,
    /// Finished and saved
    Completed,
    /// Aborted with an error
    Failed,
}

/// The status of the most recent training run of a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// The symbol being trained
    pub symbol: String,
    /// Current state
    pub status: TrainingState,
    /// Progress in percent
    pub progress: u8,
    /// Human readable description of the current phase, or the failure
    pub message: String,
    /// When the run was accepted
    pub started_at: DateTime<Utc>,
    /// When the run finished, successfully or not
    pub completed_at: Option<DateTime<Utc>>,
    /// The last finished epoch
    pub current_epoch: Option<usize>,
    /// The epoch budget
    pub total_epochs: usize,
    /// Evaluation metrics of a completed run
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Default)]
struct Registry {
    records: HashMap<String, TrainingRecord>,
    deleting: HashSet<String>,
}

impl Registry {
    fn is_training(&self, symbol: &str) -> bool {
        self.records
            .get(symbol)
            .map(|r| r.status == TrainingState::Training)
            .unwrap_or(false)
    }
}

/// Thread-safe map from symbol to its latest training record, plus the symbols being deleted
#[derive(Debug, Default)]
pub struct StatusTracker {
    registry: RwLock<Registry>,
}

/// Marks a symbol as being deleted until dropped
#[derive(Debug)]
#[must_use = "the deletion mark is cleared when the guard is dropped"]
pub struct DeletionGuard<'a> {
    tracker: &'a StatusTracker,
    symbol: String,
}

impl DeletionGuard<'_> {
    /// The symbol being deleted
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Forget the symbol's training record and clear the mark
    pub fn finish(self) -> Option<TrainingRecord> {
        let mut registry = self
            .tracker
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registry.deleting.remove(&self.symbol);
        registry.records.remove(&self.symbol)
    }
}

impl Drop for DeletionGuard<'_> {
    fn drop(&mut self) {
        self.tracker
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .deleting
            .remove(&self.symbol);
    }
}

impl StatusTracker {
    /// An empty tracker
    pub fn new() -> StatusTracker {
        StatusTracker::default()
    }

    /// Atomically admit a new run for `symbol`, failing if one is already in progress or the
    /// symbol is being deleted
    pub fn try_begin(&self, symbol: &str, total_epochs: usize) -> Result<TrainingRecord> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.is_training(symbol) {
            return Err(Error::TrainingConflict(symbol.to_string()));
        }
        if registry.deleting.contains(symbol) {
            return Err(Error::DeletionInProgress(symbol.to_string()));
        }
        let record = TrainingRecord {
            symbol: symbol.to_string(),
            status: TrainingState::Training,
            progress: progress::STARTED,
            message: "Training started".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            current_epoch: None,
            total_epochs,
            metrics: None,
        };
        registry.records.insert(symbol.to_string(), record.clone());
        debug!(symbol, "training admitted");
        Ok(record)
    }

    /// Advance a running job's progress. Progress never decreases, and finished records are
    /// left alone
    pub fn update(&self, symbol: &str, progress: u8, message: impl Into<String>) {
        self.modify_running(symbol, |record| {
            record.progress = record.progress.max(progress.min(progress::EVALUATING));
            record.message = message.into();
        });
    }

    /// Record a finished epoch
    pub fn epoch(&self, symbol: &str, epoch: usize) {
        self.modify_running(symbol, |record| {
            let total = record.total_epochs;
            record.progress = record.progress.max(progress::epoch(epoch, total));
            record.current_epoch = Some(epoch);
            record.message = format!("Training epoch {}/{}", epoch, total);
        });
    }

    /// Mark a running job completed
    pub fn complete(&self, symbol: &str, metrics: Metrics) {
        self.modify_running(symbol, |record| {
            record.status = TrainingState::Completed;
            record.progress = progress::COMPLETED;
            record.message = "Training completed successfully".to_string();
            record.completed_at = Some(Utc::now());
            record.metrics = Some(metrics);
        });
    }

    /// Mark a running job failed
    pub fn fail(&self, symbol: &str, message: impl Into<String>) {
        let message = message.into();
        self.modify_running(symbol, |record| {
            record.status = TrainingState::Failed;
            record.message = format!("Training failed: {}", message);
            record.completed_at = Some(Utc::now());
        });
    }

    /// The latest record for a symbol
    pub fn get(&self, symbol: &str) -> Option<TrainingRecord> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(symbol)
            .cloned()
    }

    /// Whether a symbol is currently training
    pub fn is_training(&self, symbol: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_training(symbol)
    }

    /// Atomically mark a symbol as being deleted. Fails if it is training or already being
    /// deleted; no run can be admitted for it until the guard is dropped
    pub fn begin_delete(&self, symbol: &str) -> Result<DeletionGuard<'_>> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.is_training(symbol) {
            return Err(Error::TrainingConflict(symbol.to_string()));
        }
        if !registry.deleting.insert(symbol.to_string()) {
            return Err(Error::DeletionInProgress(symbol.to_string()));
        }
        debug!(symbol, "deletion started");
        Ok(DeletionGuard {
            tracker: self,
            symbol: symbol.to_string(),
        })
    }

    /// The number of runs in progress
    pub fn active(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .values()
            .filter(|r| r.status == TrainingState::Training)
            .count()
    }

    fn modify_running<F: FnOnce(&mut TrainingRecord)>(&self, symbol: &str, f: F) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        match registry.records.get_mut(symbol) {
            Some(record) if record.status == TrainingState::Training => f(record),
            Some(record) => warn!(symbol, status = ?record.status, "ignoring update to finished run"),
            None => warn!(symbol, "ignoring update to unknown run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics {
            mse: 1.0,
            mae: 1.0,
            rmse: 1.0,
            r2: 0.5,
            mape: None,
        }
    }

    #[test]
    fn second_begin_conflicts() {
        let tracker = StatusTracker::new();
        tracker.try_begin("AAPL", 5).unwrap();
        assert!(matches!(
            tracker.try_begin("AAPL", 5),
            Err(Error::TrainingConflict(_))
        ));
        assert!(tracker.try_begin("MSFT", 5).is_ok());
        assert_eq!(tracker.active(), 2);
        tracker.complete("AAPL", metrics());
        assert_eq!(tracker.active(), 1);
        // Finished symbols may be retrained
        assert!(tracker.try_begin("AAPL", 5).is_ok());
    }

    #[test]
    fn progress_is_monotonic() {
        let tracker = StatusTracker::new();
        tracker.try_begin("AAPL", 10).unwrap();
        tracker.update("AAPL", progress::PREPARED, "prepared");
        tracker.update("AAPL", progress::FETCHED, "late update");
        assert_eq!(tracker.get("AAPL").unwrap().progress, progress::PREPARED);
        tracker.update("AAPL", progress::TRAINING, "training");
        tracker.epoch("AAPL", 5);
        let record = tracker.get("AAPL").unwrap();
        assert_eq!(record.progress, 75);
        assert_eq!(record.current_epoch, Some(5));
        tracker.epoch("AAPL", 10);
        assert_eq!(tracker.get("AAPL").unwrap().progress, progress::EVALUATING);
        tracker.complete("AAPL", metrics());
        let record = tracker.get("AAPL").unwrap();
        assert_eq!(record.progress, 100);
        assert_eq!(record.status, TrainingState::Completed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn finished_records_are_terminal() {
        let tracker = StatusTracker::new();
        tracker.try_begin("AAPL", 3).unwrap();
        tracker.fail("AAPL", "boom");
        tracker.complete("AAPL", metrics());
        tracker.update("AAPL", progress::EVALUATING, "ignored");
        let record = tracker.get("AAPL").unwrap();
        assert_eq!(record.status, TrainingState::Failed);
        assert_eq!(record.message, "Training failed: boom");
        assert!(record.metrics.is_none());
    }

    #[test]
    fn deletion_excludes_training() {
        let tracker = StatusTracker::new();
        tracker.try_begin("AAPL", 3).unwrap();
        assert!(matches!(
            tracker.begin_delete("AAPL"),
            Err(Error::TrainingConflict(_))
        ));
        tracker.fail("AAPL", "boom");

        let guard = tracker.begin_delete("AAPL").unwrap();
        assert_eq!(guard.symbol(), "AAPL");
        assert!(matches!(
            tracker.try_begin("AAPL", 3),
            Err(Error::DeletionInProgress(_))
        ));
        assert!(matches!(
            tracker.begin_delete("AAPL"),
            Err(Error::DeletionInProgress(_))
        ));
        // Other symbols are unaffected
        assert!(tracker.try_begin("MSFT", 3).is_ok());
        let removed = guard.finish().unwrap();
        assert_eq!(removed.status, TrainingState::Failed);
        assert!(tracker.get("AAPL").is_none());
        assert!(tracker.try_begin("AAPL", 3).is_ok());
    }

    #[test]
    fn dropped_deletion_guard_keeps_the_record() {
        let tracker = StatusTracker::new();
        tracker.try_begin("AAPL", 3).unwrap();
        tracker.complete("AAPL", metrics());
        drop(tracker.begin_delete("AAPL").unwrap());
        assert_eq!(
            tracker.get("AAPL").unwrap().status,
            TrainingState::Completed
        );
        assert!(tracker.try_begin("AAPL", 3).is_ok());
    }
}
