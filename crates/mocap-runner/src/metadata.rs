use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const TOTAL_FRAMES_KEY: &str = "Total Exported Frames";

/// A scalar attribute value. Recording headers and settings logs are
/// untyped text/JSON; values are narrowed to this once, up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            MetaValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(v) => write!(f, "{}", v),
            MetaValue::Float(v) => write!(f, "{}", v),
            MetaValue::Text(v) => f.write_str(v),
        }
    }
}

pub type SessionMetadata = BTreeMap<String, MetaValue>;

/// Anything containing a '.' is tried as a float, everything else as an
/// integer; a value that fails its parse stays text.
pub fn coerce_value(raw: &str) -> MetaValue {
    let trimmed = raw.trim();
    let parsed = if raw.contains('.') {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(MetaValue::Float)
    } else {
        trimmed.parse::<i64>().ok().map(MetaValue::Int)
    };
    parsed.unwrap_or_else(|| MetaValue::Text(raw.to_string()))
}

/// `key,value,key,value,...`; an unpaired trailing key is dropped and a
/// repeated key keeps its last value.
pub fn parse_metadata_line(line: &str) -> SessionMetadata {
    let cells: Vec<&str> = line.trim().split(',').collect();
    cells
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), coerce_value(pair[1])))
        .collect()
}

pub fn read_session_metadata(recording: &Path) -> Result<SessionMetadata> {
    let file = fs::File::open(recording)
        .with_context(|| format!("open recording {}", recording.display()))?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .with_context(|| format!("read header line of {}", recording.display()))?;
    Ok(parse_metadata_line(&first))
}

pub fn declared_frame_count(metadata: &SessionMetadata) -> Option<i64> {
    metadata.get(TOTAL_FRAMES_KEY).and_then(MetaValue::as_i64)
}
