//! Reader for frame-indexed motion-capture exports.
//!
//! Layout after the metadata line (blank lines are ignored):
//!
//! ```text
//! ,,Rigid Body,Rigid Body,...        source
//! ,,Rat,Rat,...                      entity
//! ,,1,1,...                          id (ignored)
//! ,,Rotation,Rotation,...            coordinate kind
//! Frame,Time (Seconds),X,Y,...       axis
//! 0,0.000000,0.1,0.2,...             data
//! ```
//!
//! The first two columns are the row index (frame, elapsed time). A
//! column with no axis label (e.g. "Mean Marker Error") uses its
//! coordinate kind as the axis so every column has a complete key.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::record::split_fields;

const HEADER_ROWS: usize = 5;
const SOURCE_ROW: usize = 0;
const ENTITY_ROW: usize = 1;
const KIND_ROW: usize = 3;
const AXIS_ROW: usize = 4;
const INDEX_COLUMNS: usize = 2;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unexpected header shape: {0}")]
    HeaderShape(String),
    #[error("line {line}: {message}")]
    MalformedRow { line: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ColumnKey {
    pub source: String,
    pub entity: String,
    pub kind: String,
    pub axis: String,
}

impl ColumnKey {
    /// Archive group for this column: one dataset per (source, entity, kind).
    pub fn group_path(&self) -> String {
        format!(
            "/raw/{}/{}/{}",
            path_segment(&self.source),
            path_segment(&self.entity),
            path_segment(&self.kind)
        )
    }
}

fn path_segment(name: &str) -> String {
    name.replace('/', "_")
}

#[derive(Debug, Clone, Default)]
pub struct FrameTable {
    pub frames: Vec<u64>,
    pub times: Vec<f64>,
    pub columns: Vec<ColumnKey>,
    /// Column-major; `values[c][r]` is column `c` at row `r`.
    pub values: Vec<Vec<Option<f64>>>,
}

impl FrameTable {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn column(&self, key: &ColumnKey) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .position(|c| c == key)
            .map(|i| self.values[i].as_slice())
    }
}

pub fn read_frame_table(path: &Path) -> Result<FrameTable> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read recording {}", path.display()))?;
    parse_frame_table(&text).with_context(|| format!("parse recording {}", path.display()))
}

pub fn parse_frame_table(text: &str) -> Result<FrameTable, TableError> {
    // Line numbers are 1-based and count the metadata line.
    let mut lines = text
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l));

    let mut header: Vec<Vec<String>> = Vec::with_capacity(HEADER_ROWS);
    for _ in 0..HEADER_ROWS {
        match lines.next() {
            Some((_, line)) => header.push(split_fields(line, ',')),
            None => {
                return Err(TableError::HeaderShape(format!(
                    "expected {} header rows, found {}",
                    HEADER_ROWS,
                    header.len()
                )))
            }
        }
    }

    let width = header[AXIS_ROW].len();
    if width <= INDEX_COLUMNS {
        return Err(TableError::HeaderShape(format!(
            "expected index columns plus at least one data column, found {} columns",
            width
        )));
    }
    if let Some((row, cells)) = header.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(TableError::HeaderShape(format!(
            "header row {} has {} columns, axis row has {}",
            row + 1,
            cells.len(),
            width
        )));
    }
    for idx in 0..INDEX_COLUMNS {
        if header[AXIS_ROW][idx].trim().is_empty() {
            return Err(TableError::HeaderShape(format!(
                "index column {} is unlabeled",
                idx + 1
            )));
        }
    }

    let mut columns = Vec::with_capacity(width - INDEX_COLUMNS);
    let mut seen = BTreeSet::new();
    for col in INDEX_COLUMNS..width {
        let label = |row: usize, what: &str| -> Result<String, TableError> {
            let cell = header[row][col].trim();
            if cell.is_empty() {
                Err(TableError::HeaderShape(format!(
                    "column {} has no {} label",
                    col + 1,
                    what
                )))
            } else {
                Ok(cell.to_string())
            }
        };
        let source = label(SOURCE_ROW, "source")?;
        let entity = label(ENTITY_ROW, "entity")?;
        let kind = label(KIND_ROW, "coordinate kind")?;
        let axis = match header[AXIS_ROW][col].trim() {
            "" => kind.clone(),
            a => a.to_string(),
        };
        let key = ColumnKey {
            source,
            entity,
            kind,
            axis,
        };
        if !seen.insert(key.clone()) {
            return Err(TableError::HeaderShape(format!(
                "duplicate column {}/{}/{}/{}",
                key.source, key.entity, key.kind, key.axis
            )));
        }
        columns.push(key);
    }

    let mut table = FrameTable {
        values: vec![Vec::new(); columns.len()],
        columns,
        ..FrameTable::default()
    };
    for (line_no, line) in lines {
        let fields = split_fields(line, ',');
        if fields.len() > width {
            return Err(TableError::MalformedRow {
                line: line_no,
                message: format!("{} fields, header has {}", fields.len(), width),
            });
        }
        let malformed = |message: String| TableError::MalformedRow {
            line: line_no,
            message,
        };

        let frame_raw = fields[0].trim();
        let frame: u64 = frame_raw
            .parse()
            .map_err(|_| malformed(format!("frame '{}' is not a non-negative integer", frame_raw)))?;
        let time_raw = fields.get(1).map(|s| s.trim()).unwrap_or("");
        let time: f64 = time_raw
            .parse()
            .ok()
            .filter(|t: &f64| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| malformed(format!("time '{}' is not a non-negative number", time_raw)))?;
        if let Some(&prev) = table.frames.last() {
            if frame <= prev {
                return Err(malformed(format!("frame {} does not follow {}", frame, prev)));
            }
        }
        if let Some(&prev) = table.times.last() {
            if time < prev {
                return Err(malformed(format!("time {} goes backwards from {}", time, prev)));
            }
        }

        for (c, column) in table.values.iter_mut().enumerate() {
            let cell = fields
                .get(c + INDEX_COLUMNS)
                .map(|s| s.trim())
                .unwrap_or("");
            // Non-finite samples are stored as gaps.
            let value = if cell.is_empty() {
                None
            } else {
                let v = cell.parse::<f64>().map_err(|_| {
                    malformed(format!("column {} value '{}' is not numeric", c + 3, cell))
                })?;
                v.is_finite().then_some(v)
            };
            column.push(value);
        }
        table.frames.push(frame);
        table.times.push(time);
    }
    Ok(table)
}
