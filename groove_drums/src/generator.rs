// Pattern generation from the latest model.
//
// A generation call picks up the newest checkpoint (or warm-starts), feeds the
// all-zero grid through the model, and thresholds the 192 activations into a
// binary pattern. The model is only read; nothing is trained or saved.
//
// `Generator` is the serving-side entry point and shares the registry behind a
// mutex held for the whole call, so a concurrent load can never hand it a
// half-swapped model. `generate_with` is the same operation for callers that
// own a registry outright (the CLI, tests).
//
// Output is 32 records, one per step, serialized as
// `{"step": n, "kick": bool, "snare": bool, ...}` with lanes in table order.

use crate::error::{DrumError, Result};
use crate::grid::{RhythmGrid, STEP_COUNT};
use crate::lane::{LANE_COUNT, Lane};
use crate::registry::ModelRegistry;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// One step of a generated pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    pub step: usize,
    /// Hit flags indexed by `Lane::index()`.
    pub lanes: [bool; LANE_COUNT],
}

impl StepRecord {
    pub fn hit(&self, lane: Lane) -> bool {
        self.lanes[lane.index()]
    }
}

impl Serialize for StepRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1 + LANE_COUNT))?;
        map.serialize_entry("step", &self.step)?;
        for lane in Lane::ALL {
            map.serialize_entry(lane.name(), &self.hit(lane))?;
        }
        map.end()
    }
}

/// A generated bar: exactly `STEP_COUNT` records in step order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub steps: Vec<StepRecord>,
}

impl Pattern {
    pub fn from_grid(grid: &RhythmGrid) -> Self {
        let steps = (0..STEP_COUNT)
            .map(|step| {
                let mut lanes = [false; LANE_COUNT];
                for lane in Lane::ALL {
                    lanes[lane.index()] = grid.is_active(step, lane);
                }
                StepRecord { step, lanes }
            })
            .collect();
        Pattern { steps }
    }

    pub fn to_grid(&self) -> RhythmGrid {
        let mut grid = RhythmGrid::empty();
        for record in &self.steps {
            for lane in Lane::ALL {
                if record.hit(lane) {
                    grid.set(record.step, lane);
                }
            }
        }
        grid
    }

    pub fn hit_count(&self) -> usize {
        self.steps
            .iter()
            .map(|r| r.lanes.iter().filter(|&&h| h).count())
            .sum()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.steps.serialize(serializer)
    }
}

/// Refresh `registry` to its latest checkpoint and decode one pattern.
pub fn generate_with(registry: &mut ModelRegistry, threshold: f32) -> Result<Pattern> {
    let checkpoint = registry.load_latest()?;
    let activations = registry.model().forward(&RhythmGrid::empty());
    let grid = RhythmGrid::from_activations(&activations, threshold);
    debug!(
        checkpoint = ?checkpoint,
        threshold,
        hits = grid.hit_count(),
        "generated pattern"
    );
    Ok(Pattern::from_grid(&grid))
}

/// Serving handle over a shared registry.
#[derive(Clone)]
pub struct Generator {
    registry: Arc<Mutex<ModelRegistry>>,
}

impl Generator {
    pub fn new(registry: Arc<Mutex<ModelRegistry>>) -> Self {
        Generator { registry }
    }

    pub fn registry(&self) -> &Arc<Mutex<ModelRegistry>> {
        &self.registry
    }

    pub fn generate(&self, threshold: f32) -> Result<Pattern> {
        let mut registry = self.registry.lock().map_err(|_| DrumError::RegistryPoisoned)?;
        generate_with(&mut registry, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DrumModel;
    use crate::registry::write_checkpoint;

    #[test]
    fn warm_start_generates_full_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let generator = Generator::new(Arc::new(Mutex::new(registry)));

        let pattern = generator.generate(DEFAULT_THRESHOLD).unwrap();
        assert_eq!(pattern.steps.len(), STEP_COUNT);
        for (i, record) in pattern.steps.iter().enumerate() {
            assert_eq!(record.step, i);
            assert_eq!(record.lanes.len(), LANE_COUNT);
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        // Zero biases on a zero input give exactly 0.5 everywhere.
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::new(dir.path()).unwrap();
        let all_on = generate_with(&mut registry, 0.5).unwrap();
        assert_eq!(all_on.hit_count(), STEP_COUNT * LANE_COUNT);
        assert_eq!(generate_with(&mut registry, 0.51).unwrap().hit_count(), 0);
    }

    #[test]
    fn picks_up_new_checkpoint_between_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::new(dir.path()).unwrap();
        let before = generate_with(&mut registry, 0.5).unwrap();

        let mut biased = DrumModel::warm_start(3);
        let mut state = biased.state_dict();
        if let Some(bias) = state.get_mut("decoder.bias") {
            bias.data.iter_mut().for_each(|b| *b = -4.0);
            bias.data[Lane::Kick.index()] = 4.0;
        }
        biased.load_state_dict(&state).unwrap();
        write_checkpoint(&biased, registry.checkpoint_dir(), "ckpt-1").unwrap();

        let after = generate_with(&mut registry, 0.5).unwrap();
        assert_ne!(before, after);
        assert_eq!(after.hit_count(), 1);
        assert!(after.steps[0].hit(Lane::Kick));
    }

    #[test]
    fn serializes_as_step_records() {
        let mut grid = RhythmGrid::empty();
        grid.set(0, Lane::Kick);
        grid.set(1, Lane::Percussion);
        let pattern = Pattern::from_grid(&grid);
        assert_eq!(pattern.to_grid(), grid);

        let json = serde_json::to_value(&pattern).unwrap();
        let records = json.as_array().unwrap();
        assert_eq!(records.len(), STEP_COUNT);
        assert_eq!(
            records[0],
            serde_json::json!({
                "step": 0, "kick": true, "snare": false, "hihat_closed": false,
                "hihat_open": false, "clap": false, "perc": false
            })
        );
        assert_eq!(records[1]["perc"], true);
    }
}
