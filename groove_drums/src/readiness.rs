// Dataset readiness check.
//
// Answers "will training see real data?" before a run starts: the root must
// exist, contain at least one recording, and at least one of those must
// encode. Every problem found is listed rather than stopping at the first.
// Individual unreadable files are reported but do not by themselves make the
// dataset unready.

use crate::codec::encode_file;
use crate::dataset::discover_recordings;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub midi_files: usize,
    pub issues: Vec<String>,
}

pub fn check_readiness(root: &Path) -> ReadinessReport {
    let mut issues = Vec::new();
    if !root.is_dir() {
        issues.push(format!("data root {} does not exist", root.display()));
        return ReadinessReport {
            ready: false,
            midi_files: 0,
            issues,
        };
    }

    let files = discover_recordings(root);
    if files.is_empty() {
        issues.push(format!("no .mid or .midi files under {}", root.display()));
    }

    let mut encodable = 0usize;
    for path in &files {
        match encode_file(path) {
            Ok(_) => encodable += 1,
            Err(e) => issues.push(format!("{} is unreadable: {e}", path.display())),
        }
    }
    if !files.is_empty() && encodable == 0 {
        issues.push("no recording could be encoded".to_string());
    }

    debug!(root = %root.display(), files = files.len(), encodable, "readiness checked");
    ReadinessReport {
        ready: encodable > 0,
        midi_files: files.len(),
        issues,
    }
}
