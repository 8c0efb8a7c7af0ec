//! Per-session task graph: convert the recording into an archive, then
//! attach the aligned event log, then the settings log.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use mocap_core::{sha256_file, FsTargetStore, RunReport, Scheduler, Target, Task, TaskGraph, TaskPlan};

use crate::align::{align_events, AlignedEvents, FrameClock, OverflowPolicy};
use crate::archive::{
    modify_archive, Archive, ArchiveStore, Column, ColumnData, Dataset, JsonArchiveStore,
    FRAME_COLUMN, TIME_COLUMN,
};
use crate::audit::{audit_frame_count, DiscrepancySink, FileDiscrepancyLog};
use crate::config::PipelineConfig;
use crate::events::{read_event_log, EXP_TIME_COLUMN};
use crate::locate::locate_log;
use crate::metadata::{declared_frame_count, read_session_metadata};
use crate::session::{discover_sessions, Session};
use crate::settings::read_settings_log;
use crate::table::read_frame_table;

pub const RUN_REPORT_SCHEMA: &str = "mocap_run_report_v1";

pub const EVENTS_GROUP: &str = "/events";
pub const EVENT_TABLE: &str = "/events/eventlog";
pub const EVENT_NAMES: &str = "/events/eventNames";
pub const EVENT_ARGUMENTS: &str = "/events/eventArguments";
pub const PHASE_STARTS: &str = "/events/phaseStartFrameNum";

pub fn convert_task_name(session: &Session) -> String {
    format!("convert:{}", session.name)
}

pub fn event_task_name(session: &Session) -> String {
    format!("add_event_log:{}", session.name)
}

pub fn settings_task_name(session: &Session) -> String {
    format!("add_settings_log:{}", session.name)
}

/// Run-wide collaborators shared by every task.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub archives: Arc<dyn ArchiveStore>,
    pub discrepancies: Arc<dyn DiscrepancySink>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        let log = FileDiscrepancyLog::new(config.discrepancy_log());
        Self::with_stores(config, Arc::new(JsonArchiveStore), Arc::new(log))
    }

    pub fn with_stores(
        config: PipelineConfig,
        archives: Arc<dyn ArchiveStore>,
        discrepancies: Arc<dyn DiscrepancySink>,
    ) -> Self {
        Self {
            config,
            archives,
            discrepancies,
        }
    }
}

#[derive(Debug, Clone)]
struct AlignOptions {
    reference_dataset: String,
    reference_strict: bool,
    phase_prefix: String,
    overflow: OverflowPolicy,
}

impl AlignOptions {
    fn from_config(config: &PipelineConfig) -> Self {
        Self {
            reference_dataset: config.reference_dataset.clone(),
            reference_strict: config.reference_strict,
            phase_prefix: config.phase_prefix.clone(),
            overflow: config.overflow,
        }
    }
}

pub fn build_graph(sessions: &[Session], ctx: &PipelineContext) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    for session in sessions {
        graph.extend(session_tasks(session, ctx))?;
    }
    Ok(graph)
}

/// `convert -> add_event_log -> add_settings_log` for one session.
///
/// Side logs are located while the graph is built so the located file can
/// be a dependency. When lookup fails the task depends on the exact-name
/// path instead; that file is missing, so the task always runs and fails
/// with the lookup error, blocking everything after it.
pub fn session_tasks(session: &Session, ctx: &PipelineContext) -> Vec<Task> {
    let convert_name = convert_task_name(session);
    let event_name = event_task_name(session);

    let convert = {
        let owned = session.clone();
        let archives = Arc::clone(&ctx.archives);
        let sink = Arc::clone(&ctx.discrepancies);
        Task::new(convert_name.clone(), move || {
            convert_recording(&owned, archives.as_ref(), sink.as_ref())
        })
        .file_dep(session.recording.clone())
        .target(Target::File(session.archive_path.clone()))
    };

    let events = {
        let event_dir = ctx.config.event_log_dir();
        let located = locate_log(&event_dir, session.file_name(), ctx.config.max_name_strip);
        let base = |dep: PathBuf, action: Box<dyn FnOnce() -> Result<()> + Send>| {
            Task::new(event_name.clone(), action)
                .file_dep(session.recording.clone())
                .file_dep(dep)
                .target(Target::Marker(session.event_marker()))
                .after(convert_name.clone())
        };
        match located {
            Ok(log_path) => {
                let owned = session.clone();
                let archives = Arc::clone(&ctx.archives);
                let options = AlignOptions::from_config(&ctx.config);
                base(
                    log_path.clone(),
                    Box::new(move || {
                        attach_events(&owned, &log_path, archives.as_ref(), &options)
                    }),
                )
            }
            Err(err) => {
                warn!(session = %session.name, "{}", err);
                base(
                    event_dir.join(session.file_name()),
                    Box::new(move || -> Result<()> { Err(err.into()) }),
                )
            }
        }
    };

    let settings = {
        let settings_dir = ctx.config.settings_log_dir();
        let located = locate_log(&settings_dir, session.file_name(), ctx.config.max_name_strip);
        let name = settings_task_name(session);
        let (dep, action): (PathBuf, Box<dyn FnOnce() -> Result<()> + Send>) = match located {
            Ok(log_path) => {
                let owned = session.clone();
                let archives = Arc::clone(&ctx.archives);
                (
                    log_path.clone(),
                    Box::new(move || attach_settings(&owned, &log_path, archives.as_ref())),
                )
            }
            Err(err) => {
                warn!(session = %session.name, "{}", err);
                (
                    settings_dir.join(session.file_name()),
                    Box::new(move || -> Result<()> { Err(err.into()) }),
                )
            }
        };
        Task::new(name, action)
            .file_dep(session.recording.clone())
            .file_dep(dep)
            .target(Target::Marker(session.settings_marker()))
            .after(event_name.clone())
    };

    vec![convert, events, settings]
}

fn convert_recording(
    session: &Session,
    archives: &dyn ArchiveStore,
    sink: &dyn DiscrepancySink,
) -> Result<()> {
    let metadata = read_session_metadata(&session.recording)?;
    let table = read_frame_table(&session.recording)?;
    audit_frame_count(sink, &session.name, declared_frame_count(&metadata), table.len());

    let mut archive = Archive::from_frame_table(&table)?;
    archive.merge_attrs(metadata);
    // A fresh archive has no events or settings yet, so the markers that
    // say otherwise must go before it replaces the old one.
    remove_stale_markers(session)?;
    archives.save(&session.archive_path, &archive)?;
    info!(
        session = %session.name,
        frames = table.len(),
        columns = table.columns.len(),
        "archive written"
    );
    Ok(())
}

fn remove_stale_markers(session: &Session) -> Result<()> {
    for marker in [session.event_marker(), session.settings_marker()] {
        match fs::remove_file(&marker) {
            Ok(()) => debug!(session = %session.name, marker = %marker.display(), "removed marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {}", marker.display())),
        }
    }
    Ok(())
}

fn attach_events(
    session: &Session,
    log_path: &Path,
    archives: &dyn ArchiveStore,
    options: &AlignOptions,
) -> Result<()> {
    let log = read_event_log(log_path)?;
    modify_archive(archives, &session.archive_path, |archive| {
        let clock = reference_clock(archive, &options.reference_dataset, options.reference_strict)?;
        let aligned = align_events(&clock, &log, &options.phase_prefix, options.overflow)
            .with_context(|| format!("align {}", log_path.display()))?;
        write_events(archive, &aligned)?;
        info!(
            session = %session.name,
            events = aligned.len(),
            phases = aligned.phase_start_frames.len(),
            "event log attached"
        );
        Ok(())
    })
}

fn attach_settings(session: &Session, log_path: &Path, archives: &dyn ArchiveStore) -> Result<()> {
    let settings = read_settings_log(log_path)?;
    let count = settings.len();
    modify_archive(archives, &session.archive_path, |archive| {
        archive.merge_attrs(settings);
        Ok(())
    })?;
    info!(session = %session.name, keys = count, "settings log attached");
    Ok(())
}

/// Alignment clock from `path`, or from the first raw dataset when `path`
/// is absent and `strict` is off.
pub fn reference_clock(archive: &Archive, path: &str, strict: bool) -> Result<FrameClock> {
    let chosen = if archive.get(path).is_some() {
        path.to_string()
    } else if strict {
        return Err(anyhow!("reference dataset {} not in archive", path));
    } else {
        let fallback = archive
            .paths_under("/raw")
            .next()
            .ok_or_else(|| anyhow!("archive has no raw datasets to align against"))?;
        warn!(wanted = %path, using = %fallback, "reference dataset missing; using fallback");
        fallback.to_string()
    };
    let (frames, times) = archive.frame_clock(&chosen)?;
    FrameClock::new(frames, times).with_context(|| format!("reference clock {}", chosen))
}

/// Replace the `/events` group with `aligned`. The phase dataset is only
/// written when there is at least one phase start.
pub fn write_events(archive: &mut Archive, aligned: &AlignedEvents) -> Result<()> {
    archive.remove_group(EVENTS_GROUP);

    let frames = aligned
        .frames
        .iter()
        .map(|&f| i64::try_from(f))
        .collect::<Result<Vec<i64>, _>>()
        .context("frame number exceeds archive integer range")?;
    let mut columns = vec![
        Column::new(FRAME_COLUMN, ColumnData::Int(frames)),
        Column::new(
            TIME_COLUMN,
            ColumnData::Float(aligned.times.iter().map(|&t| Some(t)).collect()),
        ),
        Column::new(
            EXP_TIME_COLUMN,
            ColumnData::Float(aligned.exp_times.iter().map(|&t| Some(t)).collect()),
        ),
    ];
    for (name, values) in &aligned.extra {
        columns.push(Column::new(name.clone(), extra_column(values)));
    }
    archive.put(EVENT_TABLE, Dataset::records(columns)?);
    archive.put(
        EVENT_NAMES,
        Dataset::Text {
            values: aligned.names.clone(),
        },
    );
    archive.put(
        EVENT_ARGUMENTS,
        Dataset::Text {
            values: aligned.arguments.clone(),
        },
    );
    if !aligned.phase_start_frames.is_empty() {
        let values = aligned
            .phase_start_frames
            .iter()
            .map(|&f| i64::try_from(f))
            .collect::<Result<Vec<i64>, _>>()
            .context("phase frame exceeds archive integer range")?;
        archive.put(PHASE_STARTS, Dataset::Int { values });
    }
    Ok(())
}

fn extra_column(values: &[String]) -> ColumnData {
    let parsed: Option<Vec<Option<f64>>> = values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .map(Some)
        })
        .collect();
    match parsed {
        Some(numbers) => ColumnData::Float(numbers),
        None => ColumnData::Text(values.iter().map(|v| v.trim().to_string()).collect()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveDigest {
    pub session: String,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub schema_version: String,
    pub sessions: usize,
    #[serde(flatten)]
    pub run: RunReport,
    pub archives: Vec<ArchiveDigest>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.run.is_success()
    }
}

/// Discover, build the graph and run it against the filesystem.
pub fn run_pipeline(ctx: &PipelineContext) -> Result<PipelineReport> {
    let sessions = discover_sessions(&ctx.config)?;
    let graph = build_graph(&sessions, ctx)?;
    let scheduler = Scheduler::new(FsTargetStore);
    let run = scheduler.run(graph)?;
    info!(
        done = run.done(),
        skipped = run.skipped(),
        failed = run.failed(),
        blocked = run.blocked(),
        "run finished"
    );

    let mut archives = Vec::new();
    for session in &sessions {
        if !ctx.archives.exists(&session.archive_path) {
            continue;
        }
        match sha256_file(&session.archive_path) {
            Ok(sha256) => archives.push(ArchiveDigest {
                session: session.name.clone(),
                path: session.archive_path.clone(),
                sha256,
            }),
            Err(err) => warn!(
                session = %session.name,
                error = %format!("{:#}", err),
                "could not digest archive; leaving it out of the report"
            ),
        }
    }
    Ok(PipelineReport {
        schema_version: RUN_REPORT_SCHEMA.to_string(),
        sessions: sessions.len(),
        run,
        archives,
    })
}

pub fn plan_pipeline(ctx: &PipelineContext) -> Result<Vec<TaskPlan>> {
    let sessions = discover_sessions(&ctx.config)?;
    let graph = build_graph(&sessions, ctx)?;
    Ok(Scheduler::new(FsTargetStore).plan(&graph)?)
}

/// Delete sentinel markers and/or archives. Returns the removed paths.
pub fn clean_outputs(sessions: &[Session], markers: bool, archives: bool) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for session in sessions {
        let mut paths = Vec::new();
        if markers {
            paths.push(session.event_marker());
            paths.push(session.settings_marker());
        }
        if archives {
            paths.push(session.archive_path.clone());
        }
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
    }
    info!(count = removed.len(), "removed outputs");
    Ok(removed)
}
