// Groove Drums: a small drum-pattern learning pipeline.
//
// Recordings (Standard MIDI Files) are quantized into 32-step x 6-lane binary
// rhythm grids, a dense autoencoder is trained to reconstruct them, and new
// one-bar patterns are decoded from the latest checkpoint.
//
// Architecture:
// - lane.rs: The six fixed percussion lanes and their General MIDI pitches
// - grid.rs: RhythmGrid, the 32x6 binary bar representation (+ text preview)
// - midi.rs: SMF read/write via midly into seconds-based Recordings
// - codec.rs: Grid encoding, in-place normalization, validation/relocation
// - dataset.rs: Recursive recording index served as grids, synthetic fallback
// - model.rs: Autoencoder parameters, forward/backward passes, Adam
// - registry.rs: Checkpoint directory, atomic snapshot writes, latest-load
// - trainer.rs: Seeded, cancellable training loop and background jobs
// - generator.rs: Thresholded pattern decoding from the latest model
// - report.rs: Dataset statistics report
// - readiness.rs: Pre-training dataset sanity check
// - error.rs: DrumError and the crate Result alias
//
// Everything random flows from explicit seeds through `groove_prng`, so a
// given dataset, seed and starting checkpoint always train to the same
// parameters.

pub mod codec;
pub mod dataset;
pub mod error;
pub mod generator;
pub mod grid;
pub mod lane;
pub mod midi;
pub mod model;
pub mod readiness;
pub mod registry;
pub mod report;
pub mod trainer;

pub use error::{DrumError, Result};
