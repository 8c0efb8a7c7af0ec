use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::record::split_fields;

pub const EVENT_DELIMITER: char = ';';
pub const NAME_COLUMN: &str = "Event";
pub const ARGUMENTS_COLUMN: &str = "EventArguments";
pub const DATETIME_COLUMN: &str = "DateTime";
pub const EXP_TIME_COLUMN: &str = "MotiveExpTimeSecs";

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log is empty")]
    Empty,
    #[error("event log has no '{0}' column")]
    MissingColumn(&'static str),
    #[error("line {line}: {found} fields, header has {expected}")]
    RowWidth {
        line: usize,
        found: usize,
        expected: usize,
    },
    #[error("line {line}: elapsed time '{value}' is not a finite number")]
    BadTime { line: usize, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub name: String,
    pub arguments: String,
    /// Seconds on the experiment software's own clock.
    pub exp_time: f64,
    /// Values of [`EventLog::extra_columns`], in order.
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLog {
    pub extra_columns: Vec<String>,
    pub records: Vec<EventRecord>,
}

impl EventLog {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn read_event_log(path: &Path) -> Result<EventLog> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read event log {}", path.display()))?;
    parse_event_log(&text).with_context(|| format!("parse event log {}", path.display()))
}

pub fn parse_event_log(text: &str) -> Result<EventLog, EventLogError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| (i + 1, l));
    let (_, header_line) = lines.next().ok_or(EventLogError::Empty)?;
    let header: Vec<String> = split_fields(header_line, EVENT_DELIMITER)
        .into_iter()
        .map(|h| h.trim_start().to_string())
        .collect();

    let find = |name: &'static str| {
        header
            .iter()
            .position(|h| h.trim_end() == name)
            .ok_or(EventLogError::MissingColumn(name))
    };
    let name_idx = find(NAME_COLUMN)?;
    let args_idx = find(ARGUMENTS_COLUMN)?;
    let datetime_idx = find(DATETIME_COLUMN)?;
    let time_idx = find(EXP_TIME_COLUMN)?;
    let known = [name_idx, args_idx, datetime_idx, time_idx];
    let extra_idx: Vec<usize> = (0..header.len()).filter(|i| !known.contains(i)).collect();

    let mut log = EventLog {
        extra_columns: extra_idx
            .iter()
            .map(|&i| header[i].trim_end().to_string())
            .collect(),
        records: Vec::new(),
    };
    for (line, raw) in lines {
        let mut fields = split_fields(raw, EVENT_DELIMITER);
        if fields.len() > header.len() {
            return Err(EventLogError::RowWidth {
                line,
                found: fields.len(),
                expected: header.len(),
            });
        }
        fields.resize(header.len(), String::new());

        let time_raw = fields[time_idx].trim();
        let exp_time = time_raw
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite())
            .ok_or_else(|| EventLogError::BadTime {
                line,
                value: time_raw.to_string(),
            })?;
        log.records.push(EventRecord {
            name: fields[name_idx].trim_start().to_string(),
            arguments: fields[args_idx].trim_start().to_string(),
            exp_time,
            extra: extra_idx.iter().map(|&i| fields[i].clone()).collect(),
        });
    }
    Ok(log)
}
