// Dataset source: the recordings under a data root, served as rhythm grids.
//
// The file index is built once at construction by a recursive, sorted scan for
// `.mid`/`.midi` files and never refreshed. Recordings are parsed on every
// access and nothing is cached.
//
// An empty index is legal. The dataset then reports length 1 and serves
// synthetic grids so a training loop always has something to iterate;
// `is_synthetic()` lets callers tell that apart from real data. Synthetic
// grids are a pure function of (seed, index).
//
// `get` never fails: an unreadable file degrades to an all-zero grid with a
// warning. `try_get` is the strict variant that returns the parse error.

use crate::codec::encode_file;
use crate::error::Result;
use crate::grid::{RhythmGrid, STEP_COUNT};
use crate::lane::Lane;
use groove_prng::GrooveRng;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Recognized recording extensions (compared case-insensitively).
pub const RECORDING_EXTENSIONS: [&str; 2] = ["mid", "midi"];

/// Inclusive range of hits per lane in a synthetic grid.
const SYNTHETIC_MIN_HITS: usize = 2;
const SYNTHETIC_MAX_HITS: usize = 6;

pub struct DrumDataset {
    root: PathBuf,
    files: Vec<PathBuf>,
    synthetic: GrooveRng,
}

impl DrumDataset {
    /// Index every recording under `root`. A missing root yields an empty
    /// index and a warning, not an error.
    pub fn new(root: impl Into<PathBuf>, seed: u64) -> Self {
        let root = root.into();
        if !root.exists() {
            warn!(root = %root.display(), "dataset root does not exist");
        }
        let files = discover_recordings(&root);
        if files.is_empty() {
            warn!(root = %root.display(), "no MIDI files found; serving synthetic patterns");
        } else {
            debug!(root = %root.display(), count = files.len(), "indexed recordings");
        }
        DrumDataset {
            root,
            files,
            synthetic: GrooveRng::new(seed),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Number of samples: the file count, but never less than 1.
    pub fn len(&self) -> usize {
        self.files.len().max(1)
    }

    /// Always false: an empty index still serves one synthetic sample.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True when no recordings were found and samples are synthetic.
    pub fn is_synthetic(&self) -> bool {
        self.files.is_empty()
    }

    /// Sample at `index` (wrapping). Unreadable files become an empty grid.
    pub fn get(&self, index: usize) -> RhythmGrid {
        match self.try_get(index) {
            Ok(grid) => grid,
            Err(e) => {
                warn!(index, error = %e, "failed to encode recording; using empty grid");
                RhythmGrid::empty()
            }
        }
    }

    /// Strict variant of [`DrumDataset::get`].
    pub fn try_get(&self, index: usize) -> Result<RhythmGrid> {
        if self.files.is_empty() {
            return Ok(self.synthetic_pattern(index));
        }
        encode_file(&self.files[index % self.files.len()])
    }

    pub fn iter(&self) -> impl Iterator<Item = RhythmGrid> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Random filler: each lane independently gets between 2 and 6 hits on
    /// distinct steps.
    fn synthetic_pattern(&self, index: usize) -> RhythmGrid {
        let mut rng = self.synthetic.fork(index as u64);
        let mut grid = RhythmGrid::empty();
        for lane in Lane::ALL {
            let k = rng.range_usize_inclusive(SYNTHETIC_MIN_HITS, SYNTHETIC_MAX_HITS);
            for step in rng.sample_distinct(STEP_COUNT, k) {
                grid.set(step, lane);
            }
        }
        grid
    }
}

/// Sorted list of every recording under `root`, recursively. Unreadable
/// directories are skipped.
pub fn discover_recordings(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_recording(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn is_recording(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            RECORDING_EXTENSIONS
                .iter()
                .any(|known| e.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
