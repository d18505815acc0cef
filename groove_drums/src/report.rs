// Dataset statistics report.
//
// Walks every sample the dataset serves (synthetic ones included, flagged by
// `synthetic`) and summarizes hit density. Integer per-lane hit counts are the
// accounting source: `total_hits` is their sum, and each density is its count
// over `32 * patterns`. `hit_total_from_density` recovers `total_hits` exactly
// from the densities by rounding to the nearest integer.

use crate::dataset::DrumDataset;
use crate::error::Result;
use crate::grid::{CELL_COUNT, STEP_COUNT};
use crate::lane::{LANE_COUNT, Lane};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Number of entries in `most_common_steps`.
pub const TOP_STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepCount {
    pub step: usize,
    pub hits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetReport {
    pub patterns: usize,
    pub synthetic: bool,
    pub total_hits: usize,
    /// Hits per lane summed over all patterns.
    #[serde(serialize_with = "serialize_lane_map")]
    pub lane_hits: [usize; LANE_COUNT],
    #[serde(serialize_with = "serialize_lane_map")]
    pub density_per_lane: [f64; LANE_COUNT],
    /// Fraction of all cells that are empty.
    pub sparsity: f64,
    /// Steps with the most hits across all lanes and patterns; ties go to the
    /// earlier step.
    pub most_common_steps: Vec<StepCount>,
    /// Hits per pattern -> number of patterns with that many hits.
    pub hits_per_pattern_distribution: BTreeMap<usize, usize>,
}

impl DatasetReport {
    pub fn density(&self, lane: Lane) -> f64 {
        self.density_per_lane[lane.index()]
    }

    /// `sum(density_per_lane) * 32 * patterns`, rounded back to a hit count.
    /// Equals `total_hits`.
    pub fn hit_total_from_density(&self) -> usize {
        let sum: f64 = self.density_per_lane.iter().sum();
        (sum * (STEP_COUNT * self.patterns) as f64).round() as usize
    }
}

fn serialize_lane_map<T, S>(
    values: &[T; LANE_COUNT],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(LANE_COUNT))?;
    for lane in Lane::ALL {
        map.serialize_entry(lane.name(), &values[lane.index()])?;
    }
    map.end()
}

pub fn collect_statistics(dataset: &DrumDataset) -> DatasetReport {
    let mut lane_hits = [0usize; LANE_COUNT];
    let mut step_hits = [0usize; STEP_COUNT];
    let mut distribution = BTreeMap::new();
    let mut patterns = 0usize;

    for grid in dataset.iter() {
        patterns += 1;
        for lane in Lane::ALL {
            lane_hits[lane.index()] += grid.lane_hits(lane);
        }
        for (step, count) in step_hits.iter_mut().enumerate() {
            *count += grid.step_hits(step);
        }
        *distribution.entry(grid.hit_count()).or_insert(0) += 1;
    }

    let total_hits: usize = lane_hits.iter().sum();
    let lane_cells = (STEP_COUNT * patterns.max(1)) as f64;
    let density_per_lane = lane_hits.map(|h| h as f64 / lane_cells);
    let sparsity = 1.0 - total_hits as f64 / (CELL_COUNT * patterns.max(1)) as f64;

    let mut ranked: Vec<StepCount> = step_hits
        .iter()
        .enumerate()
        .map(|(step, &hits)| StepCount { step, hits })
        .collect();
    ranked.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.step.cmp(&b.step)));
    ranked.truncate(TOP_STEPS);

    DatasetReport {
        patterns,
        synthetic: dataset.is_synthetic(),
        total_hits,
        lane_hits,
        density_per_lane,
        sparsity,
        most_common_steps: ranked,
        hits_per_pattern_distribution: distribution,
    }
}

/// Write `report` as pretty JSON, creating parent directories.
pub fn write_report(report: &DatasetReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    info!(path = %path.display(), patterns = report.patterns, "wrote dataset report");
    Ok(())
}
