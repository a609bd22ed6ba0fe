/*!
Mini-batch training with early stopping, learning rate decay on plateau and best-model checkpoints
*/
use crate::error::{Error, Result};
use crate::lstm::{LstmModel, StockLstm};
use crate::sequence::{Sequence, SequenceSet};
use crate::CpuFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tch::nn::{self, OptimizerConfig};
use tch::{Device, Tensor};
use tracing::{debug, info, warn};

/// File name of the best-validation-loss checkpoint inside an artifact directory
pub const BEST_CHECKPOINT: &str = "best_model.ot";

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Maximum number of passes over the training set
    pub epochs: usize,
    /// Sequences per optimizer step
    pub batch_size: usize,
    /// Initial Adam learning rate
    pub learning_rate: f64,
    /// Epochs without validation improvement before stopping
    pub early_stopping_patience: usize,
    /// Epochs without validation improvement before the learning rate is reduced
    pub lr_patience: usize,
    /// Factor applied to the learning rate on each reduction
    pub lr_factor: f64,
    /// Floor for the learning rate
    pub min_lr: f64,
    /// Seed for weight initialization and batch order; random if absent
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> TrainConfig {
        TrainConfig {
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            early_stopping_patience: 15,
            lr_patience: 10,
            lr_factor: 0.5,
            min_lr: 1e-4,
            seed: None,
        }
    }
}

/// What the plateau monitor decided after an epoch
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PlateauStep {
    /// Whether the validation loss strictly improved on the best so far
    pub improved: bool,
    /// The learning rate to use for the next epoch
    pub lr: f64,
    /// Whether training should stop now
    pub stop: bool,
}

/// Tracks validation loss for early stopping and learning rate reduction
#[derive(Debug, Clone, PartialEq)]
pub struct PlateauMonitor {
    best: f64,
    best_epoch: Option<usize>,
    stop_wait: usize,
    lr_wait: usize,
    lr: f64,
    stop_patience: usize,
    lr_patience: usize,
    lr_factor: f64,
    min_lr: f64,
}

impl PlateauMonitor {
    /// A fresh monitor with the patience and decay settings of `config`
    pub fn new(config: &TrainConfig) -> PlateauMonitor {
        PlateauMonitor {
            best: f64::INFINITY,
            best_epoch: None,
            stop_wait: 0,
            lr_wait: 0,
            lr: config.learning_rate,
            stop_patience: config.early_stopping_patience,
            lr_patience: config.lr_patience,
            lr_factor: config.lr_factor,
            min_lr: config.min_lr,
        }
    }

    /// Record the validation loss of `epoch`
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> PlateauStep {
        let improved = val_loss < self.best;
        if improved {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.stop_wait = 0;
            self.lr_wait = 0;
        } else {
            self.stop_wait += 1;
            self.lr_wait += 1;
            if self.lr_wait >= self.lr_patience && self.lr > self.min_lr {
                self.lr = (self.lr * self.lr_factor).max(self.min_lr);
                self.lr_wait = 0;
            }
        }
        PlateauStep {
            improved,
            lr: self.lr,
            stop: self.stop_wait >= self.stop_patience,
        }
    }

    /// The lowest validation loss seen so far
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_epoch.map(|epoch| (epoch, self.best))
    }

    /// The current learning rate
    pub fn lr(&self) -> f64 {
        self.lr
    }
}

/// Metrics for one epoch
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// One-based epoch number
    pub epoch: usize,
    /// Mean training loss
    pub loss: CpuFloat,
    /// Mean validation loss
    pub val_loss: CpuFloat,
    /// Mean training absolute error
    pub mae: CpuFloat,
    /// Mean validation absolute error
    pub val_mae: CpuFloat,
    /// Learning rate used during this epoch
    pub lr: CpuFloat,
}

/// Everything recorded over a training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Per-epoch metrics, in order
    pub epochs: Vec<EpochStats>,
    /// The epoch whose weights were kept
    pub best_epoch: Option<usize>,
    /// The validation loss of the kept weights
    pub best_val_loss: Option<CpuFloat>,
    /// Whether early stopping ended the run
    pub stopped_early: bool,
}

/// The result of [`Trainer::fit`]
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Per-epoch history
    pub history: History,
    /// The artifact directory the checkpoint was written to
    pub artifact_dir: PathBuf,
}

/// Fixed batches of sequences, moved to a device once
struct Batches {
    batches: Vec<(Tensor, Tensor, usize)>,
    samples: usize,
}

impl Batches {
    fn new(sequences: &[Sequence], batch_size: usize, device: Device) -> Batches {
        let batches = sequences
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let inputs: Vec<&[Vec<CpuFloat>]> =
                    chunk.iter().map(|s| s.inputs.as_slice()).collect();
                let targets: Vec<&[CpuFloat]> = chunk.iter().map(|s| s.target.as_slice()).collect();
                (
                    StockLstm::make_inputs(&inputs, device),
                    StockLstm::make_targets(&targets, device),
                    chunk.len(),
                )
            })
            .collect();
        Batches {
            batches,
            samples: sequences.len(),
        }
    }
}

/// Fits a [`LstmModel`] on a [`SequenceSet`]
#[derive(Debug, Clone)]
pub struct Trainer {
    /// The hyperparameters in use
    pub config: TrainConfig,
}

impl Trainer {
    /// Create a trainer
    pub fn new(config: TrainConfig) -> Trainer {
        Trainer { config }
    }

    /// Train `model`, checkpointing the best weights into `artifact_dir` and restoring them
    /// once training ends. `observer` is called after every epoch.
    pub fn fit<O>(
        &self,
        model: &mut LstmModel,
        set: &SequenceSet,
        artifact_dir: &Path,
        mut observer: O,
    ) -> Result<TrainOutcome>
    where
        O: FnMut(&EpochStats),
    {
        let config = &self.config;
        if config.epochs == 0 {
            return Err(Error::InvalidRequest("epochs must be at least 1".into()));
        }
        if set.train.is_empty() || set.test.is_empty() {
            return Err(Error::InsufficientData {
                needed: set.sequence_length + set.prediction_horizon + 1,
                available: set.len(),
            });
        }
        fs::create_dir_all(artifact_dir)?;
        let checkpoint = artifact_dir.join(BEST_CHECKPOINT);

        let device = model.device();
        let train = Batches::new(&set.train, config.batch_size, device);
        let test = Batches::new(&set.test, config.batch_size, device);
        let mut order: Vec<usize> = (0..train.batches.len()).collect();
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut opt = nn::Adam::default().build(&model.vs, config.learning_rate)?;
        let mut monitor = PlateauMonitor::new(config);
        let mut history = History::default();
        info!(
            train = train.samples,
            test = test.samples,
            epochs = config.epochs,
            batch_size = config.batch_size,
            "starting training"
        );

        for epoch in 1..=config.epochs {
            let lr = monitor.lr();
            order.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            let mut mae_sum = 0.0;
            for &i in &order {
                let (xs, ys, n) = &train.batches[i];
                let (loss, mae) = model.net.loss(xs, ys, true);
                opt.backward_step(&loss);
                loss_sum += loss.double_value(&[]) * *n as f64;
                mae_sum += mae.double_value(&[]) * *n as f64;
            }
            let loss = loss_sum / train.samples as f64;
            let mae = mae_sum / train.samples as f64;
            if !loss.is_finite() {
                warn!(epoch, "training loss is not finite");
                return Err(Error::NonFiniteLoss { epoch });
            }
            let (val_loss, val_mae) = validate(model, &test);
            if !val_loss.is_finite() {
                warn!(epoch, "validation loss is not finite");
                return Err(Error::NonFiniteLoss { epoch });
            }

            let stats = EpochStats {
                epoch,
                loss,
                val_loss,
                mae,
                val_mae,
                lr,
            };
            debug!(epoch, loss, val_loss, mae, val_mae, lr, "epoch finished");
            history.epochs.push(stats);
            observer(&stats);

            let step = monitor.observe(epoch, val_loss);
            if step.improved {
                model.save(&checkpoint)?;
            }
            if step.lr != lr {
                info!(epoch, from = lr, to = step.lr, "reducing learning rate");
                opt.set_lr(step.lr);
            }
            if step.stop {
                info!(epoch, "early stopping");
                history.stopped_early = true;
                break;
            }
        }

        if let Some((epoch, val_loss)) = monitor.best() {
            if checkpoint.exists() {
                model.vs.load(&checkpoint)?;
                debug!(epoch, val_loss, "restored best checkpoint");
            }
            history.best_epoch = Some(epoch);
            history.best_val_loss = Some(val_loss);
        }
        Ok(TrainOutcome {
            history,
            artifact_dir: artifact_dir.to_path_buf(),
        })
    }
}

/// Mean validation loss and absolute error, without gradients and in inference mode
fn validate(model: &LstmModel, test: &Batches) -> (CpuFloat, CpuFloat) {
    tch::no_grad(|| {
        let mut loss_sum = 0.0;
        let mut mae_sum = 0.0;
        for (xs, ys, n) in &test.batches {
            let (loss, mae) = model.net.loss(xs, ys, false);
            loss_sum += loss.double_value(&[]) * *n as f64;
            mae_sum += mae.double_value(&[]) * *n as f64;
        }
        (
            loss_sum / test.samples as f64,
            mae_sum / test.samples as f64,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fake::random_walk_ticks;
    use crate::features::engineer;
    use crate::lstm::StockLstmDesc;
    use crate::predict::Forecaster;
    use crate::sequence::build_sequences;

    fn config() -> TrainConfig {
        TrainConfig {
            early_stopping_patience: 3,
            lr_patience: 2,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn plateau_reduces_then_stops() {
        let mut monitor = PlateauMonitor::new(&config());
        assert!(monitor.observe(1, 1.0).improved);
        assert!(monitor.observe(2, 0.5).improved);
        // Equal is not an improvement
        let step = monitor.observe(3, 0.5);
        assert!(!step.improved && !step.stop);
        assert_eq!(step.lr, 0.001);
        let step = monitor.observe(4, 0.7);
        assert_eq!(step.lr, 0.0005);
        assert!(!step.stop);
        let step = monitor.observe(5, 0.6);
        assert!(step.stop);
        assert_eq!(monitor.best(), Some((2, 0.5)));
    }

    #[test]
    fn learning_rate_has_a_floor() {
        let mut monitor = PlateauMonitor::new(&TrainConfig {
            early_stopping_patience: 100,
            lr_patience: 1,
            ..TrainConfig::default()
        });
        monitor.observe(1, 1.0);
        let mut lr = 0.0;
        for epoch in 2..20 {
            lr = monitor.observe(epoch, 2.0).lr;
        }
        assert_eq!(lr, 1e-4);
    }

    #[test]
    fn improvement_resets_both_counters() {
        let mut monitor = PlateauMonitor::new(&config());
        monitor.observe(1, 1.0);
        monitor.observe(2, 1.5);
        monitor.observe(3, 0.9);
        assert!(!monitor.observe(4, 1.2).stop);
        assert!(!monitor.observe(5, 1.2).stop);
        assert!(monitor.observe(6, 1.2).stop);
    }

    #[test]
    fn fit_writes_checkpoint_and_history() {
        tch::manual_seed(11);
        let ticks: Vec<_> = random_walk_ticks(11).take(90).collect();
        let frame = engineer(&ticks).unwrap();
        let set = build_sequences(&frame, 8, 2).unwrap();
        let desc = StockLstmDesc {
            hidden: [8, 8, 4],
            dense: 4,
            ..StockLstmDesc::new(set.features(), 8, 2)
        };
        let mut model = LstmModel::new(&desc, Device::Cpu);
        let dir = tempfile::tempdir().unwrap();
        let trainer = Trainer::new(TrainConfig {
            epochs: 3,
            batch_size: 16,
            seed: Some(11),
            ..TrainConfig::default()
        });
        let mut seen = Vec::new();
        let outcome = trainer
            .fit(&mut model, &set, dir.path(), |stats| seen.push(stats.epoch))
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(outcome.history.epochs.len(), 3);
        assert!(outcome.history.best_epoch.is_some());
        assert!(dir.path().join(BEST_CHECKPOINT).exists());
        assert!(outcome
            .history
            .epochs
            .iter()
            .all(|e| e.loss.is_finite() && e.val_loss.is_finite()));
    }

    fn small_run() -> (SequenceSet, StockLstmDesc, Trainer) {
        let ticks: Vec<_> = random_walk_ticks(12).take(90).collect();
        let frame = engineer(&ticks).unwrap();
        let set = build_sequences(&frame, 8, 2).unwrap();
        let desc = StockLstmDesc {
            hidden: [8, 8, 4],
            dense: 4,
            ..StockLstmDesc::new(set.features(), 8, 2)
        };
        let trainer = Trainer::new(TrainConfig {
            epochs: 4,
            batch_size: 16,
            seed: Some(12),
            ..TrainConfig::default()
        });
        (set, desc, trainer)
    }

    #[test]
    fn nan_training_input_fails_the_first_epoch() {
        tch::manual_seed(12);
        let (mut set, desc, trainer) = small_run();
        set.train[0].inputs[0][0] = f64::NAN;
        let mut model = LstmModel::new(&desc, Device::Cpu);
        let dir = tempfile::tempdir().unwrap();
        let mut seen = 0;
        let result = trainer.fit(&mut model, &set, dir.path(), |_| seen += 1);
        assert!(matches!(result, Err(Error::NonFiniteLoss { epoch: 1 })));
        assert_eq!(seen, 0);
        assert!(!dir.path().join(BEST_CHECKPOINT).exists());
    }

    #[test]
    fn nan_validation_input_fails_the_first_epoch() {
        tch::manual_seed(12);
        let (mut set, desc, trainer) = small_run();
        set.test[0].inputs[0][0] = f64::NAN;
        let mut model = LstmModel::new(&desc, Device::Cpu);
        let dir = tempfile::tempdir().unwrap();
        let result = trainer.fit(&mut model, &set, dir.path(), |_| {});
        assert!(matches!(result, Err(Error::NonFiniteLoss { epoch: 1 })));
    }

    #[test]
    fn empty_test_split_is_rejected() {
        let (mut set, desc, trainer) = small_run();
        set.test.clear();
        let mut model = LstmModel::new(&desc, Device::Cpu);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            trainer.fit(&mut model, &set, dir.path(), |_| {}),
            Err(Error::InsufficientData { .. })
        ));
    }

    #[test]
    fn best_checkpoint_is_restored() {
        tch::manual_seed(13);
        let (set, desc, trainer) = small_run();
        let mut model = LstmModel::new(&desc, Device::Cpu);
        let dir = tempfile::tempdir().unwrap();
        let outcome = trainer.fit(&mut model, &set, dir.path(), |_| {}).unwrap();

        let history = &outcome.history;
        let (best_epoch, best_loss) = history
            .epochs
            .iter()
            .map(|e| (e.epoch, e.val_loss))
            .fold((0, f64::INFINITY), |best, e| if e.1 < best.1 { e } else { best });
        assert_eq!(history.best_epoch, Some(best_epoch));
        assert_eq!(history.best_val_loss, Some(best_loss));

        let checkpoint =
            LstmModel::load(&desc, &dir.path().join(BEST_CHECKPOINT), Device::Cpu).unwrap();
        let windows: Vec<&[Vec<CpuFloat>]> =
            set.test.iter().map(|s| s.inputs.as_slice()).collect();
        assert_eq!(
            model.forecast_batch(&windows).unwrap(),
            checkpoint.forecast_batch(&windows).unwrap()
        );
        let (val_loss, _) = validate(&model, &Batches::new(&set.test, 16, Device::Cpu));
        assert!((val_loss - best_loss).abs() < 1e-9);
    }
}
