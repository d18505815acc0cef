// The rhythm grid: one bar quantized to 32nd notes across six lanes.
//
// Indexed as `cells[step][lane]`. Values are stored as `f32` because the grid
// is fed straight into the model, but only 0.0 and 1.0 are ever stored: cells
// change through `set`/`clear`, and model output enters through
// `from_activations`, which thresholds. The shape is fixed by the type.

use crate::lane::{LANE_COUNT, Lane};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Steps per bar (32nd-note resolution).
pub const STEP_COUNT: usize = 32;

/// Number of cells in a flattened grid (model input width).
pub const CELL_COUNT: usize = STEP_COUNT * LANE_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RhythmGrid {
    cells: [[f32; LANE_COUNT]; STEP_COUNT],
}

impl Default for RhythmGrid {
    fn default() -> Self {
        Self::empty()
    }
}

impl RhythmGrid {
    /// All-zero grid.
    pub fn empty() -> Self {
        RhythmGrid {
            cells: [[0.0; LANE_COUNT]; STEP_COUNT],
        }
    }

    /// Build a binary grid from raw model activations: a cell is on when its
    /// activation is `>= threshold`. `activations` is step-major, lane-minor.
    ///
    /// Panics if `activations.len() != CELL_COUNT`.
    pub fn from_activations(activations: &[f32], threshold: f32) -> Self {
        assert_eq!(activations.len(), CELL_COUNT, "activation vector has wrong width");
        let mut grid = Self::empty();
        for (i, &a) in activations.iter().enumerate() {
            if a >= threshold {
                grid.cells[i / LANE_COUNT][i % LANE_COUNT] = 1.0;
            }
        }
        grid
    }

    /// Turn a cell on. Setting an already-active cell is a no-op.
    ///
    /// Panics if `step >= STEP_COUNT`.
    pub fn set(&mut self, step: usize, lane: Lane) {
        self.cells[step][lane.index()] = 1.0;
    }

    pub fn clear(&mut self, step: usize, lane: Lane) {
        self.cells[step][lane.index()] = 0.0;
    }

    pub fn is_active(&self, step: usize, lane: Lane) -> bool {
        self.cells[step][lane.index()] > 0.5
    }

    /// The six lane values at one step, in lane order.
    pub fn step(&self, step: usize) -> &[f32; LANE_COUNT] {
        &self.cells[step]
    }

    pub fn hit_count(&self) -> usize {
        self.cells
            .iter()
            .flat_map(|row| row.iter())
            .filter(|&&v| v > 0.5)
            .count()
    }

    pub fn lane_hits(&self, lane: Lane) -> usize {
        (0..STEP_COUNT).filter(|&s| self.is_active(s, lane)).count()
    }

    pub fn step_hits(&self, step: usize) -> usize {
        Lane::ALL.iter().filter(|&&l| self.is_active(step, l)).count()
    }

    /// Flatten to the model's input layout (step-major, lane-minor).
    pub fn to_vec(&self) -> Vec<f32> {
        self.cells.iter().flat_map(|row| row.iter().copied()).collect()
    }
}

/// Text rendering, one line per step: `step 00: [1 0 0 0 0 0]`.
impl fmt::Display for RhythmGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Lane::ALL.iter().map(|l| l.name()).collect();
        writeln!(f, "         [{}]", names.join(" "))?;
        for step in 0..STEP_COUNT {
            let row: Vec<&str> = Lane::ALL
                .iter()
                .map(|&l| if self.is_active(step, l) { "1" } else { "0" })
                .collect();
            writeln!(f, "step {step:02}: [{}]", row.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_grid_has_fixed_shape() {
        let grid = RhythmGrid::empty();
        assert_eq!(grid.to_vec().len(), CELL_COUNT);
        assert_eq!(grid.hit_count(), 0);
    }

    #[test]
    fn set_is_idempotent() {
        let mut grid = RhythmGrid::empty();
        grid.set(4, Lane::Snare);
        grid.set(4, Lane::Snare);
        assert_eq!(grid.hit_count(), 1);
        assert!(grid.is_active(4, Lane::Snare));
        grid.clear(4, Lane::Snare);
        assert_eq!(grid.hit_count(), 0);
    }

    #[test]
    fn flattened_layout_is_step_major() {
        let mut grid = RhythmGrid::empty();
        grid.set(1, Lane::OpenHiHat);
        let flat = grid.to_vec();
        assert_eq!(flat[LANE_COUNT + Lane::OpenHiHat.index()], 1.0);
        assert_eq!(flat.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn from_activations_thresholds_inclusively() {
        let mut acts = vec![0.2; CELL_COUNT];
        acts[0] = 0.5;
        acts[CELL_COUNT - 1] = 0.9;
        let grid = RhythmGrid::from_activations(&acts, 0.5);
        assert!(grid.is_active(0, Lane::Kick));
        assert!(grid.is_active(STEP_COUNT - 1, Lane::Percussion));
        assert_eq!(grid.hit_count(), 2);
        assert!(grid.to_vec().iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn display_has_one_line_per_step() {
        let mut grid = RhythmGrid::empty();
        grid.set(0, Lane::Kick);
        let text = grid.to_string();
        assert_eq!(text.lines().count(), STEP_COUNT + 1);
        assert!(text.contains("step 00: [1 0 0 0 0 0]"));
        assert!(text.contains("step 31: [0 0 0 0 0 0]"));
    }
}
