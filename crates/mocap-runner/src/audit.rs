use anyhow::{Context, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use mocap_core::ensure_dir;

/// Declared and parsed frame counts of one recording disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub session: String,
    pub parsed: usize,
    pub declared: i64,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Incomplete: {} (parsed {} frames of {} declared frames)",
            self.session, self.parsed, self.declared
        )
    }
}

/// Run-wide, append-only destination for discrepancy records.
pub trait DiscrepancySink: Send + Sync {
    fn record(&self, discrepancy: &Discrepancy) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileDiscrepancyLog {
    path: PathBuf,
}

impl FileDiscrepancyLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiscrepancySink for FileDiscrepancyLog {
    fn record(&self, discrepancy: &Discrepancy) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open discrepancy log {}", self.path.display()))?;
        writeln!(file, "{}", discrepancy)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDiscrepancyLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryDiscrepancyLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}

impl DiscrepancySink for MemoryDiscrepancyLog {
    fn record(&self, discrepancy: &Discrepancy) -> Result<()> {
        self.lines
            .lock()
            .map_err(|_| anyhow::anyhow!("discrepancy log lock poisoned"))?
            .push(discrepancy.to_string());
        Ok(())
    }
}

/// Compare declared and parsed frame counts. Advisory only: a mismatch is
/// logged to `sink`, and neither a mismatch nor a sink failure is an error.
pub fn audit_frame_count(
    sink: &dyn DiscrepancySink,
    session: &str,
    declared: Option<i64>,
    parsed: usize,
) -> Option<Discrepancy> {
    let Some(declared) = declared else {
        warn!(session, "recording header declares no total frame count");
        return None;
    };
    if i64::try_from(parsed).map_or(false, |p| p == declared) {
        return None;
    }
    let discrepancy = Discrepancy {
        session: session.to_string(),
        parsed,
        declared,
    };
    info!(session, parsed, declared, "frame count mismatch");
    if let Err(err) = sink.record(&discrepancy) {
        warn!(session, error = %format!("{:#}", err), "could not record discrepancy");
    }
    Some(discrepancy)
}
