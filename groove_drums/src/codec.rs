// Grid codec: recordings to rhythm grids, plus the normalization and
// validation passes run over a dataset before training.
//
// `encode` quantizes note starts onto 32 steps by integer division of the
// start time by `duration / 32`. It is a set union over hits: any number of
// notes landing in the same (step, lane) produce one active cell. Pitches
// outside the lane table, and notes on non-percussion tracks, are ignored.
//
// `normalize` rewrites a recording in place so that it already is what
// `encode` will see: drum notes only, allowed pitches only, one note per
// (pitch, step), every note snapped to its step with a fixed length and a
// clamped velocity. It reports whether anything changed and is idempotent.
//
// `validate` decides whether a recording is usable at all. The dataset-level
// drivers (`normalize_dataset`, `validate_dataset`) never stop on a bad file:
// they log it and count it, and validation relocates unusable files out of
// the working set instead of deleting them.

use crate::dataset::discover_recordings;
use crate::error::Result;
use crate::grid::{RhythmGrid, STEP_COUNT};
use crate::lane::{Lane, is_allowed_pitch};
use crate::midi::{NoteEvent, Recording, read_recording, write_recording};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Step duration used when a recording reports no usable length.
pub const DEFAULT_STEP_DURATION: f64 = 0.5;

/// Velocity range kept by normalization.
pub const MIN_VELOCITY: u8 = 30;
pub const MAX_VELOCITY: u8 = 110;

/// Shortest note length written by normalization, in seconds.
const MIN_NOTE_LENGTH: f64 = 0.05;

/// Times closer than this are considered equal when detecting changes.
/// Larger than the rounding error of one write/read cycle through MIDI ticks.
const TIME_TOLERANCE: f64 = 1e-3;

/// Step duration for a bar of `total_duration` seconds.
pub fn step_duration(total_duration: f64) -> f64 {
    if total_duration.is_finite() && total_duration > 0.0 {
        total_duration / STEP_COUNT as f64
    } else {
        DEFAULT_STEP_DURATION
    }
}

/// Step index for a note start, by floor division, clamped to the bar.
fn quantize_floor(start: f64, step_duration: f64) -> usize {
    let step = (start / step_duration).floor();
    if step.is_nan() || step < 0.0 {
        0
    } else {
        (step as usize).min(STEP_COUNT - 1)
    }
}

/// Step index for a note start, rounded to the nearest step, clamped.
fn quantize_round(start: f64, step_duration: f64) -> usize {
    let step = (start / step_duration).round();
    if step.is_nan() || step < 0.0 {
        0
    } else {
        (step as usize).min(STEP_COUNT - 1)
    }
}

/// Quantize percussion events onto a rhythm grid.
pub fn encode<'a, I>(events: I, total_duration: f64) -> RhythmGrid
where
    I: IntoIterator<Item = &'a NoteEvent>,
{
    let step_duration = step_duration(total_duration);
    let mut grid = RhythmGrid::empty();
    for event in events {
        if let Some(lane) = Lane::from_pitch(event.pitch) {
            grid.set(quantize_floor(event.start, step_duration), lane);
        }
    }
    grid
}

/// Encode the percussion tracks of a recording over its own duration.
pub fn encode_recording(recording: &Recording) -> RhythmGrid {
    encode(recording.percussion_events(), recording.duration)
}

/// Read and encode one file. Parse failures are returned, not swallowed.
pub fn encode_file(path: &Path) -> Result<RhythmGrid> {
    let recording = read_recording(path)?;
    Ok(encode_recording(&recording))
}

/// Snap a recording onto the grid in place. Returns `true` if anything
/// changed. A usable duration is kept as is; an unusable one is replaced by
/// the default bar length. Snapped notes never end past the bar, so the
/// duration read back from a rewritten file is the one written.
pub fn normalize(recording: &mut Recording) -> bool {
    let mut changed = false;
    if !(recording.duration.is_finite() && recording.duration > 0.0) {
        recording.duration = DEFAULT_STEP_DURATION * STEP_COUNT as f64;
        changed = true;
    }
    let total = recording.duration;
    let step_duration = step_duration(total);
    let note_length = (step_duration * 0.5).max(MIN_NOTE_LENGTH);

    for instrument in &mut recording.instruments {
        if !instrument.is_drum() {
            if !instrument.notes.is_empty() {
                instrument.notes.clear();
                changed = true;
            }
            continue;
        }

        let mut seen: BTreeSet<(u8, usize)> = BTreeSet::new();
        let mut kept: Vec<NoteEvent> = Vec::with_capacity(instrument.notes.len());
        for note in &instrument.notes {
            if !is_allowed_pitch(note.pitch) {
                changed = true;
                continue;
            }
            let step = quantize_round(note.start, step_duration);
            if !seen.insert((note.pitch, step)) {
                changed = true;
                continue;
            }
            let start = step as f64 * step_duration;
            let snapped = NoteEvent {
                pitch: note.pitch,
                start,
                end: (start + note_length).min(total),
                velocity: note.velocity.clamp(MIN_VELOCITY, MAX_VELOCITY),
            };
            if (snapped.start - note.start).abs() > TIME_TOLERANCE
                || (snapped.end - note.end).abs() > TIME_TOLERANCE
                || snapped.velocity != note.velocity
            {
                changed = true;
            }
            kept.push(snapped);
        }
        instrument.notes = kept;
    }

    // Drop instruments emptied above so rewritten files carry no dead tracks.
    let before = recording.instruments.len();
    recording.instruments.retain(|i| !i.notes.is_empty());
    if recording.instruments.len() != before {
        changed = true;
    }

    changed
}

/// Normalize a file in place, rewriting it only if something changed.
pub fn normalize_file(path: &Path) -> Result<bool> {
    let mut recording = read_recording(path)?;
    let changed = normalize(&mut recording);
    if changed {
        write_recording(&recording, path)?;
        info!(path = %path.display(), "normalized recording");
    }
    Ok(changed)
}

/// Counts from a dataset-wide normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeSummary {
    pub scanned: usize,
    pub changed: usize,
    pub failed: usize,
}

/// Normalize every recording under `root`. Unreadable files are logged and
/// counted; they do not stop the pass.
pub fn normalize_dataset(root: &Path) -> NormalizeSummary {
    let mut summary = NormalizeSummary::default();
    for path in discover_recordings(root) {
        summary.scanned += 1;
        match normalize_file(&path) {
            Ok(true) => summary.changed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to normalize recording");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Outcome of validating one recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Validity {
    Valid,
    /// Parsed, but no percussion note maps to a lane.
    MissingRequiredLanes,
    /// Could not be parsed.
    Unreadable(String),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// A recording is valid iff at least one percussion-track note maps to a lane.
pub fn validate(recording: &Recording) -> Validity {
    if recording.percussion_events().any(|n| is_allowed_pitch(n.pitch)) {
        Validity::Valid
    } else {
        Validity::MissingRequiredLanes
    }
}

pub fn validate_file(path: &Path) -> Validity {
    match read_recording(path) {
        Ok(recording) => validate(&recording),
        Err(e) => Validity::Unreadable(e.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct ValidateOptions {
    /// Move unusable files out of the dataset root.
    pub relocate: bool,
    /// Destination for relocated files. Defaults to `<root parent>/invalid`.
    pub invalid_dir: Option<PathBuf>,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        ValidateOptions {
            relocate: true,
            invalid_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    /// Files that failed to parse.
    pub unreadable: Vec<PathBuf>,
    /// Files with no mapped percussion notes.
    pub missing_required: Vec<PathBuf>,
    /// (original, destination) for every relocated file.
    pub relocated: Vec<(PathBuf, PathBuf)>,
}

/// Default relocation directory: a sibling `invalid/` next to the root.
pub fn default_invalid_dir(root: &Path) -> PathBuf {
    root.parent()
        .map(|p| p.join("invalid"))
        .unwrap_or_else(|| PathBuf::from("invalid"))
}

/// Validate every recording under `root`, optionally relocating the flagged
/// ones. Relocation failures are returned since a half-moved dataset should
/// not go unnoticed.
pub fn validate_dataset(root: &Path, options: &ValidateOptions) -> Result<ValidationSummary> {
    let mut summary = ValidationSummary::default();

    for path in discover_recordings(root) {
        summary.total += 1;
        match validate_file(&path) {
            Validity::Valid => summary.valid += 1,
            Validity::MissingRequiredLanes => {
                warn!(path = %path.display(), "recording has no mapped drum notes");
                summary.missing_required.push(path);
            }
            Validity::Unreadable(reason) => {
                warn!(path = %path.display(), %reason, "unreadable recording");
                summary.unreadable.push(path);
            }
        }
    }

    let has_invalid = !summary.unreadable.is_empty() || !summary.missing_required.is_empty();
    if options.relocate && has_invalid {
        let invalid_dir = options
            .invalid_dir
            .clone()
            .unwrap_or_else(|| default_invalid_dir(root));
        std::fs::create_dir_all(&invalid_dir)?;
        let flagged: Vec<PathBuf> = summary
            .unreadable
            .iter()
            .chain(summary.missing_required.iter())
            .cloned()
            .collect();
        for path in flagged {
            let destination = relocate(&path, &invalid_dir)?;
            info!(
                from = %path.display(),
                to = %destination.display(),
                "relocated invalid recording"
            );
            summary.relocated.push((path, destination));
        }
    }

    info!(
        total = summary.total,
        valid = summary.valid,
        unreadable = summary.unreadable.len(),
        missing_required = summary.missing_required.len(),
        "validation finished"
    );
    Ok(summary)
}

/// Move `path` into `dir`, adding a numeric suffix instead of overwriting.
fn relocate(path: &Path, dir: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "recording.mid".into());
    let mut destination = dir.join(&file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut n = 1;
    while destination.exists() {
        destination = dir.join(format!("{stem}-{n}.{extension}"));
        n += 1;
    }
    if std::fs::rename(path, &destination).is_err() {
        // Cross-device moves need copy + remove.
        std::fs::copy(path, &destination)?;
        std::fs::remove_file(path)?;
    }
    Ok(destination)
}
