//! Per-session archive: container attributes plus datasets addressed by
//! path-like group names (`/raw/Rigid Body/Rat/Position`,
//! `/events/eventlog`, ...).

use anyhow::{anyhow, Context, Result};
use mocap_core::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::metadata::MetaValue;
use crate::table::FrameTable;

pub const ARCHIVE_SCHEMA: &str = "mocap_archive_v1";
pub const FRAME_COLUMN: &str = "Frame";
pub const TIME_COLUMN: &str = "Time";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Int(Vec<i64>),
    Float(Vec<Option<f64>>),
    Text(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dataset {
    Records { columns: Vec<Column> },
    Text { values: Vec<String> },
    Int { values: Vec<i64> },
}

impl Dataset {
    pub fn records(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let rows = first.data.len();
            if let Some(bad) = columns.iter().find(|c| c.data.len() != rows) {
                return Err(anyhow!(
                    "column '{}' has {} rows, expected {}",
                    bad.name,
                    bad.data.len(),
                    rows
                ));
            }
        }
        Ok(Dataset::Records { columns })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        match self {
            Dataset::Records { columns } => {
                columns.iter().find(|c| c.name == name).map(|c| &c.data)
            }
            _ => None,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Dataset::Records { columns } => columns.first().map_or(0, |c| c.data.len()),
            Dataset::Text { values } => values.len(),
            Dataset::Int { values } => values.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub schema_version: String,
    pub attrs: BTreeMap<String, MetaValue>,
    pub datasets: BTreeMap<String, Dataset>,
}

impl Default for Archive {
    fn default() -> Self {
        Self {
            schema_version: ARCHIVE_SCHEMA.to_string(),
            attrs: BTreeMap::new(),
            datasets: BTreeMap::new(),
        }
    }
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// One records dataset per (source, entity, kind) group, each carrying
    /// `Frame` and `Time` ahead of its axis columns.
    pub fn from_frame_table(table: &FrameTable) -> Result<Self> {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, key) in table.columns.iter().enumerate() {
            groups.entry(key.group_path()).or_default().push(i);
        }
        let frames: Vec<i64> = table
            .frames
            .iter()
            .map(|&f| i64::try_from(f))
            .collect::<Result<Vec<i64>, _>>()
            .context("frame number exceeds archive integer range")?;
        let times: Vec<Option<f64>> = table.times.iter().map(|&t| Some(t)).collect();

        let mut archive = Archive::new();
        for (path, members) in groups {
            let mut columns = vec![
                Column::new(FRAME_COLUMN, ColumnData::Int(frames.clone())),
                Column::new(TIME_COLUMN, ColumnData::Float(times.clone())),
            ];
            for i in members {
                columns.push(Column::new(
                    table.columns[i].axis.clone(),
                    ColumnData::Float(table.values[i].clone()),
                ));
            }
            archive.put(path, Dataset::records(columns)?);
        }
        Ok(archive)
    }

    /// Later values win on key collisions.
    pub fn merge_attrs<I>(&mut self, attrs: I)
    where
        I: IntoIterator<Item = (String, MetaValue)>,
    {
        self.attrs.extend(attrs);
    }

    /// Replaces any existing dataset at `path`.
    pub fn put(&mut self, path: impl Into<String>, dataset: Dataset) -> Option<Dataset> {
        self.datasets.insert(path.into(), dataset)
    }

    pub fn get(&self, path: &str) -> Option<&Dataset> {
        self.datasets.get(path)
    }

    /// Remove every dataset under `group` (e.g. `/events`).
    pub fn remove_group(&mut self, group: &str) -> usize {
        let prefix = format!("{}/", group.trim_end_matches('/'));
        let before = self.datasets.len();
        self.datasets.retain(|path, _| !path.starts_with(&prefix));
        before - self.datasets.len()
    }

    pub fn paths_under<'a>(&'a self, group: &str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = format!("{}/", group.trim_end_matches('/'));
        self.datasets
            .keys()
            .filter(move |p| p.starts_with(&prefix))
            .map(String::as_str)
    }

    /// The `Frame`/`Time` index of a records dataset.
    pub fn frame_clock(&self, path: &str) -> Result<(Vec<u64>, Vec<f64>)> {
        let dataset = self
            .get(path)
            .ok_or_else(|| anyhow!("archive has no dataset {}", path))?;
        let frames = match dataset.column(FRAME_COLUMN) {
            Some(ColumnData::Int(v)) => v
                .iter()
                .map(|&f| u64::try_from(f))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("negative frame number in {}", path))?,
            _ => return Err(anyhow!("{} has no integer {} column", path, FRAME_COLUMN)),
        };
        let times = match dataset.column(TIME_COLUMN) {
            Some(ColumnData::Float(v)) => v
                .iter()
                .map(|t| t.ok_or_else(|| anyhow!("missing time value in {}", path)))
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(anyhow!("{} has no float {} column", path, TIME_COLUMN)),
        };
        Ok((frames, times))
    }
}

/// Storage backend for archives. Implementations must make `save`
/// all-or-nothing: the archive file doubles as a scheduler target.
pub trait ArchiveStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn load(&self, path: &Path) -> Result<Archive>;
    fn save(&self, path: &Path, archive: &Archive) -> Result<()>;
}

/// Pretty-printed JSON with ordered maps, so equal archives are
/// byte-identical on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArchiveStore;

impl ArchiveStore for JsonArchiveStore {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn load(&self, path: &Path) -> Result<Archive> {
        let bytes = fs::read(path).with_context(|| format!("read archive {}", path.display()))?;
        let archive: Archive = serde_json::from_slice(&bytes)
            .with_context(|| format!("decode archive {}", path.display()))?;
        if archive.schema_version != ARCHIVE_SCHEMA {
            return Err(anyhow!(
                "archive {} has schema {} (expected {})",
                path.display(),
                archive.schema_version,
                ARCHIVE_SCHEMA
            ));
        }
        Ok(archive)
    }

    fn save(&self, path: &Path, archive: &Archive) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(archive)?;
        bytes.push(b'\n');
        atomic_write_bytes(path, &bytes)
    }
}

/// Read-modify-write of one archive. Nothing is written if `f` fails.
pub fn modify_archive<S, F>(store: &S, path: &Path, f: F) -> Result<()>
where
    S: ArchiveStore + ?Sized,
    F: FnOnce(&mut Archive) -> Result<()>,
{
    let mut archive = store.load(path)?;
    f(&mut archive)?;
    store.save(path, &archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::parse_frame_table;
    use chrono::Utc;

    const RECORDING: &str = "\
Total Exported Frames,2
,,Rigid Body,Rigid Body,Rigid Body,Marker
,,Rat,Rat,Rat,Rat:M1
,,1,1,1,2
,,Position,Position,Position,Position
Frame,Time,X,Y,Z,X
0,0.0,1,2,3,4
1,0.5,1,2,3,
";

    #[test]
    fn frame_table_groups_by_source_entity_kind() {
        let table = parse_frame_table(RECORDING).expect("table");
        let archive = Archive::from_frame_table(&table).expect("archive");
        let paths: Vec<&str> = archive.paths_under("/raw").collect();
        assert_eq!(
            paths,
            vec!["/raw/Marker/Rat:M1/Position", "/raw/Rigid Body/Rat/Position"]
        );
        let body = archive.get("/raw/Rigid Body/Rat/Position").expect("body");
        assert_eq!(body.rows(), 2);
        assert_eq!(body.column("Y"), Some(&ColumnData::Float(vec![Some(2.0), Some(2.0)])));
        let (frames, times) = archive
            .frame_clock("/raw/Rigid Body/Rat/Position")
            .expect("clock");
        assert_eq!(frames, vec![0, 1]);
        assert_eq!(times, vec![0.0, 0.5]);
    }

    #[test]
    fn records_reject_ragged_columns() {
        let err = Dataset::records(vec![
            Column::new("a", ColumnData::Int(vec![1, 2])),
            Column::new("b", ColumnData::Text(vec!["x".into()])),
        ])
        .expect_err("ragged");
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn remove_group_only_touches_that_group() {
        let mut archive = Archive::new();
        archive.put("/events/eventNames", Dataset::Text { values: vec![] });
        archive.put("/events/eventlog", Dataset::Int { values: vec![] });
        archive.put("/eventsextra", Dataset::Int { values: vec![] });
        assert_eq!(archive.remove_group("/events"), 2);
        assert!(archive.get("/eventsextra").is_some());
    }

    #[test]
    fn json_store_roundtrips_and_is_deterministic() {
        let root = std::env::temp_dir().join(format!(
            "mocap_archive_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("s").join("s.archive.json");
        let store = JsonArchiveStore;
        let table = parse_frame_table(RECORDING).expect("table");
        let mut archive = Archive::from_frame_table(&table).expect("archive");
        archive.merge_attrs([("speed".to_string(), MetaValue::Float(1.5))]);
        store.save(&path, &archive).expect("save");
        let first = fs::read(&path).expect("read");
        assert_eq!(store.load(&path).expect("load"), archive);

        modify_archive(&store, &path, |_| Ok(())).expect("noop modify");
        assert_eq!(fs::read(&path).expect("read"), first);

        let failed = modify_archive(&store, &path, |a| {
            a.attrs.clear();
            Err(anyhow!("abort"))
        });
        assert!(failed.is_err());
        assert_eq!(fs::read(&path).expect("read"), first);
        let _ = fs::remove_dir_all(root);
    }
}
