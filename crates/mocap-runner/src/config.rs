use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::align::OverflowPolicy;

pub const DEFAULT_REFERENCE_DATASET: &str = "/raw/Rigid Body/Rat/Position";

/// Pipeline settings. Every field has a default so a YAML file only needs
/// the keys it changes; CLI flags are applied on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub recordings_dir: PathBuf,
    /// Defaults to `processed_data` beside `recordings_dir`.
    pub output_dir: Option<PathBuf>,
    /// Defaults to `logs/event_logs` beside `recordings_dir`.
    pub event_log_dir: Option<PathBuf>,
    /// Defaults to `logs/settings_logs` beside `recordings_dir`.
    pub settings_log_dir: Option<PathBuf>,
    /// Defaults to `log_csv_to_archive.txt` in the output directory.
    pub discrepancy_log: Option<PathBuf>,
    pub recording_extension: String,
    /// Case-insensitive substrings; matching recordings are skipped.
    pub exclude: Vec<String>,
    pub limit: Option<usize>,
    pub max_name_strip: usize,
    pub reference_dataset: String,
    /// Fail instead of falling back to the first raw dataset when
    /// `reference_dataset` is absent from an archive.
    pub reference_strict: bool,
    pub phase_prefix: String,
    pub overflow: OverflowPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("."),
            output_dir: None,
            event_log_dir: None,
            settings_log_dir: None,
            discrepancy_log: None,
            recording_extension: "csv".to_string(),
            exclude: vec!["test".to_string(), "habit".to_string()],
            limit: None,
            max_name_strip: 14,
            reference_dataset: DEFAULT_REFERENCE_DATASET.to_string(),
            reference_strict: false,
            phase_prefix: "set_".to_string(),
            overflow: OverflowPolicy::Clamp,
        }
    }
}

impl PipelineConfig {
    /// Relative paths in the file are taken relative to the file itself.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.rebase(base);
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.recordings_dir);
        for p in [
            &mut self.output_dir,
            &mut self.event_log_dir,
            &mut self.settings_log_dir,
            &mut self.discrepancy_log,
        ]
        .into_iter()
        .flatten()
        {
            fix(p);
        }
    }

    fn sibling(&self, name: &str) -> PathBuf {
        match self.recordings_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
            _ => self.recordings_dir.join("..").join(name),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.sibling("processed_data"))
    }

    pub fn event_log_dir(&self) -> PathBuf {
        self.event_log_dir
            .clone()
            .unwrap_or_else(|| self.sibling("logs").join("event_logs"))
    }

    pub fn settings_log_dir(&self) -> PathBuf {
        self.settings_log_dir
            .clone()
            .unwrap_or_else(|| self.sibling("logs").join("settings_logs"))
    }

    pub fn discrepancy_log(&self) -> PathBuf {
        self.discrepancy_log
            .clone()
            .unwrap_or_else(|| self.output_dir().join("log_csv_to_archive.txt"))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.recordings_dir.is_dir() {
            return Err(anyhow!(
                "recordings directory not found: {}",
                self.recordings_dir.display()
            ));
        }
        if self.recording_extension.trim_start_matches('.').is_empty() {
            return Err(anyhow!("recording_extension must not be empty"));
        }
        if self.max_name_strip == 0 {
            return Err(anyhow!("max_name_strip must be at least 1"));
        }
        for (what, dir) in [
            ("event log", self.event_log_dir()),
            ("settings log", self.settings_log_dir()),
        ] {
            if !dir.is_dir() {
                warn!(dir = %dir.display(), "{} directory not found; those tasks will fail", what);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn defaults_place_outputs_beside_recordings() {
        let config = PipelineConfig {
            recordings_dir: PathBuf::from("/data/exp/Converted"),
            ..PipelineConfig::default()
        };
        assert_eq!(config.output_dir(), PathBuf::from("/data/exp/processed_data"));
        assert_eq!(
            config.event_log_dir(),
            PathBuf::from("/data/exp/logs/event_logs")
        );
        assert_eq!(
            config.discrepancy_log(),
            PathBuf::from("/data/exp/processed_data/log_csv_to_archive.txt")
        );
    }

    #[test]
    fn yaml_overrides_and_relative_paths() {
        let root = std::env::temp_dir().join(format!(
            "mocap_config_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("csv")).expect("dirs");
        let path = root.join("pipeline.yaml");
        fs::write(
            &path,
            "recordings_dir: csv\nevent_log_dir: /abs/events\nmax_name_strip: 4\noverflow: reject\nexclude: [calib]\n",
        )
        .expect("write");
        let config = PipelineConfig::load(&path).expect("load");
        assert_eq!(config.recordings_dir, root.join("csv"));
        assert_eq!(config.event_log_dir(), PathBuf::from("/abs/events"));
        assert_eq!(config.max_name_strip, 4);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert_eq!(config.exclude, vec!["calib"]);
        assert_eq!(config.phase_prefix, "set_");
        config.validate().expect("valid");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(serde_yaml::from_str::<PipelineConfig>("recordings: x\n").is_err());
        let config = PipelineConfig {
            recordings_dir: std::env::temp_dir(),
            max_name_strip: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
