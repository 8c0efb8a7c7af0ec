use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::PipelineConfig;

pub const ARCHIVE_EXTENSION: &str = "archive.json";
pub const EVENT_MARKER: &str = "event_log_added.txt";
pub const SETTINGS_MARKER: &str = "settings_log_added.txt";

/// One recording and where its outputs go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Recording file stem; unique per run.
    pub name: String,
    pub recording: PathBuf,
    pub archive_dir: PathBuf,
    pub archive_path: PathBuf,
}

impl Session {
    pub fn new(recording: PathBuf, output_dir: &Path) -> Option<Self> {
        let name = recording.file_stem()?.to_str()?.to_string();
        let archive_dir = output_dir.join(&name);
        let archive_path = archive_dir.join(format!("{}.{}", name, ARCHIVE_EXTENSION));
        Some(Self {
            name,
            recording,
            archive_dir,
            archive_path,
        })
    }

    /// Recording file name with extension, used to look up side logs.
    pub fn file_name(&self) -> &str {
        self.recording
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }

    pub fn event_marker(&self) -> PathBuf {
        self.archive_dir.join(EVENT_MARKER)
    }

    pub fn settings_marker(&self) -> PathBuf {
        self.archive_dir.join(SETTINGS_MARKER)
    }
}

/// Recordings under `recordings_dir`, sorted by path. `limit` is applied
/// to the sorted list before exclusion; exclusion patterns are matched
/// against the path relative to `recordings_dir`.
pub fn discover_sessions(config: &PipelineConfig) -> Result<Vec<Session>> {
    let ext = config
        .recording_extension
        .trim_start_matches('.')
        .to_ascii_lowercase();
    let mut recordings = Vec::new();
    for entry in WalkDir::new(&config.recordings_dir).follow_links(true) {
        let entry = entry.with_context(|| {
            format!("scan recordings under {}", config.recordings_dir.display())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.to_ascii_lowercase() == ext);
        if matches {
            recordings.push(entry.into_path());
        }
    }
    recordings.sort();
    if let Some(limit) = config.limit {
        recordings.truncate(limit);
    }

    let exclude: Vec<String> = config.exclude.iter().map(|s| s.to_lowercase()).collect();
    let output_dir = config.output_dir();
    let mut sessions: Vec<Session> = Vec::with_capacity(recordings.len());
    for recording in recordings {
        let relative = recording
            .strip_prefix(&config.recordings_dir)
            .unwrap_or(&recording);
        let lowered = relative.to_string_lossy().to_lowercase();
        if let Some(hit) = exclude.iter().find(|s| lowered.contains(s.as_str())) {
            debug!(recording = %recording.display(), pattern = %hit, "excluded");
            continue;
        }
        let Some(session) = Session::new(recording.clone(), &output_dir) else {
            debug!(recording = %recording.display(), "skipping recording without a usable name");
            continue;
        };
        if sessions.iter().any(|s| s.name == session.name) {
            return Err(anyhow::anyhow!(
                "two recordings map to session '{}': {}",
                session.name,
                recording.display()
            ));
        }
        sessions.push(session);
    }
    info!(count = sessions.len(), "discovered sessions");
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!(
            "mocap_session_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn discovery_recurses_sorts_and_excludes() {
        let root = scratch();
        let recordings = root.join("Converted");
        fs::create_dir_all(recordings.join("day2")).expect("dirs");
        for f in [
            "day2/B.csv",
            "A.CSV",
            "Habituation_1.csv",
            "calib_TEST.csv",
            "notes.txt",
        ] {
            fs::write(recordings.join(f), b"").expect("write");
        }
        let config = PipelineConfig {
            recordings_dir: recordings.clone(),
            ..PipelineConfig::default()
        };
        let sessions = discover_sessions(&config).expect("discover");
        let names: Vec<&str> = sessions.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(
            sessions[0].archive_path,
            root.join("processed_data").join("A").join("A.archive.json")
        );
        assert_eq!(sessions[1].file_name(), "B.csv");
        assert_eq!(
            sessions[1].settings_marker(),
            root.join("processed_data").join("B").join(SETTINGS_MARKER)
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn limit_applies_before_exclusion() {
        let root = scratch();
        fs::create_dir_all(&root).expect("dir");
        for f in ["a_test.csv", "b.csv", "c.csv"] {
            fs::write(root.join(f), b"").expect("write");
        }
        let config = PipelineConfig {
            recordings_dir: root.clone(),
            output_dir: Some(root.join("out")),
            limit: Some(2),
            ..PipelineConfig::default()
        };
        let sessions = discover_sessions(&config).expect("discover");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "b");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_stems_are_rejected() {
        let root = scratch();
        fs::create_dir_all(root.join("x")).expect("dir");
        fs::write(root.join("S.csv"), b"").expect("write");
        fs::write(root.join("x").join("S.csv"), b"").expect("write");
        let config = PipelineConfig {
            recordings_dir: root.clone(),
            output_dir: Some(root.join("out")),
            ..PipelineConfig::default()
        };
        assert!(discover_sessions(&config).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
