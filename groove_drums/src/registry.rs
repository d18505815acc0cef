// Model registry: the single owner of the in-process drum model and of the
// checkpoint directory.
//
// Layout: `<model_root>/checkpoints/<name>.json`. Checkpoint names are
// timestamp tags (`ckpt-YYYYMMDD-HHMMSS-uuuuuu`, UTC) so that ordering by file
// stem is creation order, and "latest" is simply the greatest stem. Stems are
// compared rather than full file names so a stem that extends another
// (`ckpt-2024` vs `ckpt-2`) always sorts after it.
//
// `load_latest` parses the newest checkpoint into a fresh model and only swaps
// it in once it has been fully read and checked, so a reader never sees a half
// loaded model and a corrupt file leaves the current one in place. With no
// checkpoints it performs a deterministic warm-start instead.
//
// Writes go to a hidden temp file in the same directory, are synced, and are
// then hard-linked to the final name, which fails rather than replace an
// existing checkpoint. Checkpoints are never modified or deleted afterwards.
//
// The registry is an ordinary value. Serving code shares it behind
// `Arc<Mutex<_>>` (see `generator.rs`); training owns one outright.

use crate::error::{DrumError, Result};
use crate::grid::RhythmGrid;
use crate::model::{Adam, DrumModel, PARAMETER_NAMES, ParamTensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Subdirectory of the model root holding checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Checkpoint file extension.
pub const CHECKPOINT_EXTENSION: &str = "json";

/// Prefix of generated checkpoint names.
pub const CHECKPOINT_PREFIX: &str = "ckpt-";

/// Seed for warm-starts when none is configured.
pub const DEFAULT_WARM_START_SEED: u64 = 0x6472_756d_735f_7631;

const FORMAT_VERSION: u32 = 1;

/// On-disk checkpoint: named parameters plus a CRC32 over their contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    parameters: BTreeMap<String, ParamTensor>,
    checksum: u32,
}

fn parameter_checksum(parameters: &BTreeMap<String, ParamTensor>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (name, tensor) in parameters {
        hasher.update(name.as_bytes());
        hasher.update(&(tensor.rows as u64).to_le_bytes());
        hasher.update(&(tensor.cols as u64).to_le_bytes());
        for value in &tensor.data {
            hasher.update(&value.to_le_bytes());
        }
    }
    hasher.finalize()
}

/// Read a checkpoint file into a new model.
pub fn read_checkpoint(path: &Path) -> Result<DrumModel> {
    let bytes = fs::read(path)?;
    let file: CheckpointFile = serde_json::from_slice(&bytes)?;
    if file.format_version != FORMAT_VERSION {
        return Err(DrumError::UnsupportedFormat(file.format_version));
    }
    let computed = parameter_checksum(&file.parameters);
    if computed != file.checksum {
        return Err(DrumError::ChecksumMismatch {
            stored: file.checksum,
            computed,
        });
    }
    let mut model = DrumModel::new();
    model.load_state_dict(&file.parameters)?;
    Ok(model)
}

/// Write `model` as `<dir>/<stem>.json` without ever replacing an existing
/// file or leaving a partial one behind.
pub fn write_checkpoint(model: &DrumModel, dir: &Path, stem: &str) -> Result<PathBuf> {
    let parameters = model.state_dict();
    debug_assert_eq!(parameters.len(), PARAMETER_NAMES.len());
    let file = CheckpointFile {
        format_version: FORMAT_VERSION,
        checksum: parameter_checksum(&parameters),
        parameters,
    };

    let final_path = dir.join(format!("{stem}.{CHECKPOINT_EXTENSION}"));
    let temp_path = dir.join(format!(".{stem}.{CHECKPOINT_EXTENSION}.tmp"));

    let written = (|| -> Result<()> {
        let handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(handle);
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
        let handle = writer.into_inner().map_err(|e| e.into_error())?;
        handle.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    let published = match fs::hard_link(&temp_path, &final_path) {
        Ok(()) => fs::remove_file(&temp_path).map_err(DrumError::from),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e.into()),
        // Filesystems without hard links: fall back to a checked rename.
        Err(_) if !final_path.exists() => {
            fs::rename(&temp_path, &final_path).map_err(DrumError::from)
        }
        Err(e) => Err(e.into()),
    };
    if let Err(e) = published {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(final_path)
}

/// Every checkpoint in `dir`, sorted oldest to newest by stem. Hidden temp
/// files and other extensions are ignored.
pub fn list_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }
        found.push((stem.to_string(), path));
    }
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct ModelRegistry {
    root: PathBuf,
    checkpoint_dir: PathBuf,
    model: DrumModel,
    active: Option<PathBuf>,
    warm_start_seed: u64,
}

impl ModelRegistry {
    /// Open a registry rooted at `root`, creating `root/checkpoints` if needed.
    /// The model starts warm-started; call `load_latest` to pick up saved
    /// parameters.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_seed(root, DEFAULT_WARM_START_SEED)
    }

    pub fn with_seed(root: impl Into<PathBuf>, warm_start_seed: u64) -> Result<Self> {
        let root = root.into();
        let checkpoint_dir = root.join(CHECKPOINT_DIR);
        fs::create_dir_all(&checkpoint_dir)?;
        Ok(ModelRegistry {
            root,
            checkpoint_dir,
            model: DrumModel::warm_start(warm_start_seed),
            active: None,
            warm_start_seed,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn model(&self) -> &DrumModel {
        &self.model
    }

    /// The checkpoint the current parameters came from, or `None` after a
    /// warm-start.
    pub fn active_checkpoint(&self) -> Option<&Path> {
        self.active.as_deref()
    }

    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        list_checkpoints(&self.checkpoint_dir)
    }

    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop())
    }

    /// Load the newest checkpoint, or warm-start if there is none. Returns
    /// the checkpoint that is now active.
    pub fn load_latest(&mut self) -> Result<Option<PathBuf>> {
        match self.latest_checkpoint()? {
            Some(path) => {
                if self.active.as_deref() == Some(path.as_path()) {
                    // Checkpoints are immutable, so the loaded copy is current.
                    return Ok(Some(path));
                }
                let loaded = read_checkpoint(&path)?;
                self.model = loaded;
                info!(checkpoint = %path.display(), "loaded checkpoint");
                self.active = Some(path.clone());
                Ok(Some(path))
            }
            None => {
                self.warm_start();
                Ok(None)
            }
        }
    }

    /// Reset to the deterministic initialization.
    pub fn warm_start(&mut self) {
        self.model = DrumModel::warm_start(self.warm_start_seed);
        self.active = None;
        debug!(seed = self.warm_start_seed, "warm-started model");
    }

    /// One optimizer update of the owned model. Returns the batch loss
    /// computed before the update.
    pub fn train_step(
        &mut self,
        optimizer: &mut Adam,
        inputs: &[RhythmGrid],
        targets: &[RhythmGrid],
    ) -> f32 {
        let (loss, grads) = self.model.loss_and_gradients(inputs, targets);
        optimizer.step(&mut self.model, &grads);
        // The parameters no longer match any file on disk.
        self.active = None;
        loss
    }

    /// Persist the current parameters under a fresh name that sorts after
    /// every existing checkpoint, and mark it active.
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        let latest = self.latest_checkpoint()?.map(|p| stem_of(&p));
        let stem = next_checkpoint_stem(now_micros(), latest.as_deref());
        let path = write_checkpoint(&self.model, &self.checkpoint_dir, &stem)?;
        info!(checkpoint = %path.display(), "saved checkpoint");
        self.active = Some(path.clone());
        Ok(path)
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Name for a checkpoint created at `micros` that sorts after `latest`.
/// A clock behind the newest generated name is moved past it; a foreign name
/// that no timestamp can exceed is extended instead.
fn next_checkpoint_stem(micros: u64, latest: Option<&str>) -> String {
    let Some(latest) = latest else {
        return checkpoint_stem(micros);
    };
    let micros = match parse_checkpoint_stem(latest) {
        Some(previous) if previous >= micros => previous + 1,
        _ => micros,
    };
    let stem = checkpoint_stem(micros);
    if stem.as_str() > latest {
        stem
    } else {
        format!("{latest}-{}", &stem[CHECKPOINT_PREFIX.len()..])
    }
}

/// `ckpt-YYYYMMDD-HHMMSS-uuuuuu` for a UTC time in microseconds.
pub fn checkpoint_stem(micros: u64) -> String {
    let seconds = micros / 1_000_000;
    let sub = micros % 1_000_000;
    let days = (seconds / 86_400) as i64;
    let rem = seconds % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{CHECKPOINT_PREFIX}{year:04}{month:02}{day:02}-{:02}{:02}{:02}-{sub:06}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Inverse of [`checkpoint_stem`]; `None` for any other name.
fn parse_checkpoint_stem(stem: &str) -> Option<u64> {
    let rest = stem.strip_prefix(CHECKPOINT_PREFIX)?;
    let bytes = rest.as_bytes();
    if bytes.len() != 22 || bytes[8] != b'-' || bytes[15] != b'-' {
        return None;
    }
    let num = |range: std::ops::Range<usize>| -> Option<u64> { rest.get(range)?.parse().ok() };
    let (year, month, day) = (num(0..4)?, num(4..6)?, num(6..8)?);
    let (hour, minute, second) = (num(9..11)?, num(11..13)?, num(13..15)?);
    let sub = num(16..22)?;
    let days = days_from_civil(year as i64, month as u32, day as u32);
    if days < 0 {
        return None;
    }
    let seconds = days as u64 * 86_400 + hour * 3600 + minute * 60 + second;
    Some(seconds * 1_000_000 + sub)
}

// Proleptic Gregorian calendar conversions (H. Hinnant's algorithms).

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year.rem_euclid(400);
    let month = month as i64;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_warm_starts() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::with_seed(dir.path(), 17).unwrap();
        assert!(dir.path().join(CHECKPOINT_DIR).is_dir());
        assert_eq!(registry.load_latest().unwrap(), None);
        assert_eq!(registry.active_checkpoint(), None);
        assert_eq!(registry.model(), &DrumModel::warm_start(17));
    }

    #[test]
    fn latest_is_greatest_name_not_greatest_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::new(dir.path()).unwrap();
        let checkpoints = registry.checkpoint_dir().to_path_buf();

        write_checkpoint(&DrumModel::warm_start(2), &checkpoints, "ckpt-2").unwrap();
        write_checkpoint(&DrumModel::warm_start(10), &checkpoints, "ckpt-10").unwrap();
        let newest = DrumModel::warm_start(2024);
        write_checkpoint(&newest, &checkpoints, "ckpt-20240101-000000-000000").unwrap();
        fs::write(checkpoints.join("notes.txt"), "ignored").unwrap();

        let loaded = registry.load_latest().unwrap().unwrap();
        assert_eq!(loaded.file_name().unwrap(), "ckpt-20240101-000000-000000.json");
        assert_eq!(registry.model(), &newest);
        assert_eq!(registry.active_checkpoint(), Some(loaded.as_path()));
    }

    #[test]
    fn save_then_load_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::with_seed(dir.path(), 4).unwrap();
        let saved = registry.save_checkpoint().unwrap();

        let mut other = ModelRegistry::with_seed(dir.path(), 99).unwrap();
        assert_eq!(other.load_latest().unwrap(), Some(saved));
        assert_eq!(other.model(), registry.model());
        let zero = RhythmGrid::empty();
        assert_eq!(other.model().forward(&zero), registry.model().forward(&zero));
    }

    #[test]
    fn successive_saves_sort_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::new(dir.path()).unwrap();
        let first = registry.save_checkpoint().unwrap();
        let second = registry.save_checkpoint().unwrap();
        assert!(stem_of(&second) > stem_of(&first));
        assert_eq!(registry.list_checkpoints().unwrap(), vec![first, second]);
    }

    #[test]
    fn corrupt_latest_is_an_error_and_keeps_current_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ModelRegistry::with_seed(dir.path(), 8).unwrap();
        let before = registry.model().clone();
        fs::write(registry.checkpoint_dir().join("ckpt-9.json"), b"{ not json").unwrap();

        assert!(registry.load_latest().is_err());
        assert_eq!(registry.model(), &before);
    }

    #[test]
    fn tampered_parameters_fail_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(&DrumModel::warm_start(1), dir.path(), "ckpt-a").unwrap();
        let mut file: CheckpointFile = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        if let Some(bias) = file.parameters.get_mut("decoder.bias") {
            bias.data[0] += 1.0;
        }
        fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        assert!(matches!(read_checkpoint(&path), Err(DrumError::ChecksumMismatch { .. })));
    }

    #[test]
    fn write_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(&DrumModel::warm_start(1), dir.path(), "ckpt-x").unwrap();
        assert!(write_checkpoint(&DrumModel::warm_start(2), dir.path(), "ckpt-x").is_err());
        assert_eq!(
            read_checkpoint(&dir.path().join("ckpt-x.json")).unwrap(),
            DrumModel::warm_start(1)
        );
        // No temp file is left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn failed_publish_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the final name makes the link step fail
        // after the temp file has been fully written.
        fs::create_dir(dir.path().join("ckpt-d.json")).unwrap();

        let result = write_checkpoint(&DrumModel::warm_start(1), dir.path(), "ckpt-d");
        assert!(result.is_err());
        assert!(leftover_temp_files(dir.path()).is_empty());
        assert!(dir.path().join("ckpt-d.json").is_dir());
        assert!(list_checkpoints(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn failed_write_into_missing_dir_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(write_checkpoint(&DrumModel::warm_start(1), &missing, "ckpt-m").is_err());
        assert!(!missing.exists());
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[test]
    fn stem_format_round_trips() {
        // 2024-02-29 13:45:07.000123 UTC
        let micros = 1_709_214_307_000_123;
        let stem = checkpoint_stem(micros);
        assert_eq!(stem, "ckpt-20240229-134507-000123");
        assert_eq!(parse_checkpoint_stem(&stem), Some(micros));
        assert_eq!(parse_checkpoint_stem("ckpt-2"), None);
    }

    #[test]
    fn next_stem_always_sorts_after_latest() {
        let now = 1_709_214_307_000_123;
        assert_eq!(next_checkpoint_stem(now, None), checkpoint_stem(now));

        // Clock behind the newest checkpoint.
        let ahead = checkpoint_stem(now + 5_000_000);
        let next = next_checkpoint_stem(now, Some(&ahead));
        assert!(next > ahead);
        assert_eq!(parse_checkpoint_stem(&next), Some(now + 5_000_001));

        // Foreign names that no timestamp exceeds.
        let next = next_checkpoint_stem(now, Some("ckpt-zzz"));
        assert!(next.as_str() > "ckpt-zzz");

        let next = next_checkpoint_stem(now, Some("ckpt-2024"));
        assert!(next.as_str() > "ckpt-2024");
    }
}
