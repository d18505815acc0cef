// Training loop for the drum autoencoder.
//
// A run is fully described by `TrainingConfig`. One seed drives everything
// random: the registry's warm-start, the dataset's synthetic stream, and the
// trainer's own stream (epoch shuffles and input dropout, forked from the seed
// so it does not alias the other two). Combined with the fixed-order gradient
// reduction in `model.rs`, two runs with the same config over the same data
// and starting checkpoint produce identical parameters.
//
// The trainer continues from the latest checkpoint when one exists. Each epoch
// visits every sample once in a shuffled order, in mini-batches. Inputs are
// corrupted by dropping active cells with probability `input_dropout` and the
// model learns to reconstruct the clean grid (a denoising objective).
//
// Cancellation is cooperative: a `CancelToken` is checked before each batch.
// A cancelled run returns `DrumError::Cancelled` and writes nothing; only a
// completed run publishes exactly one new checkpoint.
//
// `spawn_training` runs a whole job on a background thread and returns a
// handle that can cancel it or wait for the outcome.

use crate::dataset::DrumDataset;
use crate::error::{DrumError, Result};
use crate::grid::{RhythmGrid, STEP_COUNT};
use crate::lane::Lane;
use crate::model::Adam;
use crate::registry::ModelRegistry;
use groove_prng::GrooveRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info};

/// Stream id for the trainer's shuffle/dropout PRNG.
const TRAINER_STREAM: u64 = 0x7472_6169_6e;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Directory searched recursively for `.mid`/`.midi` recordings.
    pub data_root: PathBuf,
    /// Directory holding `checkpoints/`.
    pub model_root: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub seed: u64,
    /// Probability of dropping each active input cell during training.
    pub input_dropout: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            data_root: PathBuf::from("data"),
            model_root: PathBuf::from("models"),
            epochs: 10,
            batch_size: 8,
            learning_rate: 1e-3,
            seed: 42,
            input_dropout: 0.1,
        }
    }
}

impl TrainingConfig {
    /// Read a config from JSON. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: TrainingConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DrumError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DrumError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.input_dropout) {
            return Err(DrumError::InvalidConfig(format!(
                "input_dropout must be in [0, 1), got {}",
                self.input_dropout
            )));
        }
        Ok(())
    }
}

/// Shared flag asking a training run to stop at its next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    /// The checkpoint written at the end of the run.
    pub checkpoint: PathBuf,
    /// Mean batch loss of each epoch, in order.
    pub epoch_losses: Vec<f32>,
}

pub struct Trainer {
    config: TrainingConfig,
    dataset: DrumDataset,
    registry: ModelRegistry,
    optimizer: Adam,
    rng: GrooveRng,
    epoch: usize,
}

impl Trainer {
    /// Index the dataset and open the registry, continuing from its latest
    /// checkpoint if there is one.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let dataset = DrumDataset::new(&config.data_root, config.seed);
        let mut registry = ModelRegistry::with_seed(&config.model_root, config.seed)?;
        match registry.load_latest()? {
            Some(path) => info!(checkpoint = %path.display(), "continuing from checkpoint"),
            None => info!("no checkpoint found; starting from warm-start"),
        }
        Ok(Trainer {
            optimizer: Adam::new(config.learning_rate),
            rng: GrooveRng::new(config.seed).fork(TRAINER_STREAM),
            epoch: 0,
            config,
            dataset,
            registry,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn dataset(&self) -> &DrumDataset {
        &self.dataset
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Epochs completed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// One optimizer update on `batch` (clean targets). Returns the batch
    /// loss before the update.
    pub fn train_step(&mut self, batch: &[RhythmGrid]) -> f32 {
        let inputs: Vec<RhythmGrid> = batch.iter().map(|g| self.corrupt(g)).collect();
        self.registry.train_step(&mut self.optimizer, &inputs, batch)
    }

    /// One pass over the dataset. Returns the mean batch loss.
    pub fn run_epoch(&mut self) -> f32 {
        self.epoch_pass(None).unwrap_or(0.0)
    }

    /// Like [`Trainer::run_epoch`], stopping before the next batch once
    /// `cancel` is set.
    pub fn run_epoch_until(&mut self, cancel: &CancelToken) -> Result<f32> {
        self.epoch_pass(Some(cancel))
    }

    fn epoch_pass(&mut self, cancel: Option<&CancelToken>) -> Result<f32> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        self.rng.shuffle(&mut order);

        let mut total = 0.0;
        let mut batches = 0usize;
        for chunk in order.chunks(self.config.batch_size) {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                info!(epoch = self.epoch, batch = batches, "training cancelled");
                return Err(DrumError::Cancelled);
            }
            let batch: Vec<RhythmGrid> = chunk.iter().map(|&i| self.dataset.get(i)).collect();
            let loss = self.train_step(&batch);
            debug!(epoch = self.epoch, batch = batches, loss, "batch done");
            total += loss;
            batches += 1;
        }
        self.epoch += 1;
        Ok(total / batches.max(1) as f32)
    }

    /// Run every configured epoch, then publish one checkpoint.
    pub fn train(mut self, cancel: &CancelToken) -> Result<TrainOutcome> {
        info!(
            samples = self.dataset.len(),
            synthetic = self.dataset.is_synthetic(),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            "training started"
        );
        let mut epoch_losses = Vec::with_capacity(self.config.epochs);
        for _ in 0..self.config.epochs {
            let loss = self.run_epoch_until(cancel)?;
            info!(epoch = self.epoch, loss, "epoch finished");
            epoch_losses.push(loss);
        }
        if cancel.is_cancelled() {
            return Err(DrumError::Cancelled);
        }
        let checkpoint = self.registry.save_checkpoint()?;
        Ok(TrainOutcome {
            checkpoint,
            epoch_losses,
        })
    }

    /// Copy of `grid` with each active cell dropped with probability
    /// `input_dropout`.
    fn corrupt(&mut self, grid: &RhythmGrid) -> RhythmGrid {
        let p = self.config.input_dropout;
        let mut input = *grid;
        if p <= 0.0 {
            return input;
        }
        for step in 0..STEP_COUNT {
            for lane in Lane::ALL {
                if input.is_active(step, lane) && self.rng.random_bool(p as f64) {
                    input.clear(step, lane);
                }
            }
        }
        input
    }
}

/// Run a whole training job on the calling thread.
pub fn train(config: TrainingConfig, cancel: &CancelToken) -> Result<TrainOutcome> {
    Trainer::new(config)?.train(cancel)
}

/// A training job running on its own thread.
pub struct TrainingHandle {
    cancel: CancelToken,
    thread: Option<thread::JoinHandle<Result<TrainOutcome>>>,
}

impl TrainingHandle {
    /// Ask the job to stop at its next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the job. A panic on the training thread is resumed here.
    pub fn join(mut self) -> Result<TrainOutcome> {
        match self.thread.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Err(DrumError::Cancelled),
        }
    }
}

/// Start `config` on a background thread.
pub fn spawn_training(config: TrainingConfig) -> TrainingHandle {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let thread = thread::spawn(move || train(config, &token));
    TrainingHandle {
        cancel,
        thread: Some(thread),
    }
}

/// Mean squared reconstruction error of the registry's current model over
/// `samples`. No parameters change.
pub fn evaluate(registry: &ModelRegistry, samples: &[RhythmGrid]) -> f32 {
    registry.model().reconstruction_mse(samples)
}
