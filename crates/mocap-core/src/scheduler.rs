//! Incremental task scheduler.
//!
//! A [`TaskGraph`] is built up front from named tasks with file
//! dependencies, targets and predecessor names; [`Scheduler::run`] then
//! walks it in dependency order. A task is skipped when all of its
//! targets exist and none is older than any dependency. Completion state
//! is never persisted apart from the targets themselves, which is what
//! lets an interrupted run resume on the next invocation.

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::TargetStore;

pub type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("task '{task}' depends on unknown task '{missing}'")]
    UnknownPredecessor { task: String, missing: String },
    #[error("dependency cycle among tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("illegal transition for task '{task}': {from:?} -> {to:?}")]
    IllegalTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Target {
    /// A file the action itself must produce.
    File(PathBuf),
    /// A zero-byte file the executor writes once the action succeeds.
    Marker(PathBuf),
}

impl Target {
    pub fn path(&self) -> &Path {
        match self {
            Target::File(p) | Target::Marker(p) => p,
        }
    }
}

pub struct Task {
    pub name: String,
    pub file_deps: Vec<PathBuf>,
    pub targets: Vec<Target>,
    pub task_deps: Vec<String>,
    action: Action,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            file_deps: Vec::new(),
            targets: Vec::new(),
            task_deps: Vec::new(),
            action: Box::new(action),
        }
    }

    pub fn file_dep(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_deps.push(path.into());
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.task_deps.push(predecessor.into());
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("file_deps", &self.file_deps)
            .field("targets", &self.targets)
            .field("task_deps", &self.task_deps)
            .finish_non_exhaustive()
    }
}

/// `Pending -> Stale -> Running -> Done | Failed`, or
/// `Pending -> Fresh -> Skipped`. A task whose predecessor did not
/// complete never leaves `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Stale,
    Fresh,
    Running,
    Done,
    Skipped,
    Failed,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Stale)
                | (Pending, Fresh)
                | (Stale, Running)
                | (Fresh, Skipped)
                | (Running, Done)
                | (Running, Failed)
        )
    }

    /// Successors may proceed only past these states.
    pub fn is_complete(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoTargets,
    MissingTarget(PathBuf),
    MissingDependency(PathBuf),
    Outdated { target: PathBuf, dependency: PathBuf },
    PredecessorRan(String),
    Unreadable { path: PathBuf, message: String },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NoTargets => write!(f, "no targets declared"),
            StaleReason::MissingTarget(p) => write!(f, "target missing: {}", p.display()),
            StaleReason::MissingDependency(p) => {
                write!(f, "dependency missing: {}", p.display())
            }
            StaleReason::Outdated { target, dependency } => write!(
                f,
                "{} is older than {}",
                target.display(),
                dependency.display()
            ),
            StaleReason::PredecessorRan(name) => write!(f, "predecessor '{}' ran", name),
            StaleReason::Unreadable { path, message } => {
                write!(f, "cannot stat {}: {}", path.display(), message)
            }
        }
    }
}

#[derive(Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: BTreeMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Task) -> Result<(), SchedulerError> {
        if self.index.contains_key(&task.name) {
            return Err(SchedulerError::DuplicateTask(task.name));
        }
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<(), SchedulerError> {
        for task in tasks {
            self.add(task)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    /// Kahn's algorithm; among ready tasks the one added first goes first,
    /// so the order is stable across runs.
    pub fn execution_order(&self) -> Result<Vec<usize>, SchedulerError> {
        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.task_deps {
                let dep_idx = *self.index.get(dep).ok_or_else(|| {
                    SchedulerError::UnknownPredecessor {
                        task: task.name.clone(),
                        missing: dep.clone(),
                    }
                })?;
                in_degree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(first) = ready.pop_first() {
            order.push(first);
            for &next in &dependents[first] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let cyclic = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.tasks[i].name.clone())
                .collect();
            return Err(SchedulerError::Cycle(cyclic));
        }
        Ok(order)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Done,
    Skipped,
    Failed { error: String },
    Blocked { by: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }

    pub fn executed(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Done | TaskStatus::Failed { .. }))
    }

    pub fn done(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Done))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Failed { .. }))
    }

    pub fn blocked(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Blocked { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.blocked() == 0
    }

    pub fn outcome(&self, name: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    pub name: String,
    pub fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct Scheduler<S: TargetStore> {
    store: S,
}

impl<S: TargetStore> Scheduler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Target/dependency comparison only; predecessor state is handled by
    /// the caller.
    pub fn check_freshness(&self, task: &Task) -> Freshness {
        self.freshness_of(&task.file_deps, &task.targets)
    }

    fn freshness_of(&self, file_deps: &[PathBuf], targets: &[Target]) -> Freshness {
        if targets.is_empty() {
            return Freshness::Stale(StaleReason::NoTargets);
        }

        let mut newest_dep = None;
        for dep in file_deps {
            match self.store.modified_at(dep) {
                Ok(Some(t)) => {
                    if newest_dep.as_ref().map_or(true, |(prev, _)| t > *prev) {
                        newest_dep = Some((t, dep));
                    }
                }
                Ok(None) => return Freshness::Stale(StaleReason::MissingDependency(dep.clone())),
                Err(e) => {
                    return Freshness::Stale(StaleReason::Unreadable {
                        path: dep.clone(),
                        message: e.to_string(),
                    })
                }
            }
        }

        for target in targets {
            let path = target.path();
            let modified = match self.store.modified_at(path) {
                Ok(Some(t)) => t,
                Ok(None) => return Freshness::Stale(StaleReason::MissingTarget(path.to_path_buf())),
                Err(e) => {
                    return Freshness::Stale(StaleReason::Unreadable {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })
                }
            };
            if let Some((dep_time, dep)) = &newest_dep {
                if modified < *dep_time {
                    return Freshness::Stale(StaleReason::Outdated {
                        target: path.to_path_buf(),
                        dependency: (*dep).clone(),
                    });
                }
            }
        }
        Freshness::Fresh
    }

    /// Predict what `run` would do, assuming every stale task succeeds.
    pub fn plan(&self, graph: &TaskGraph) -> Result<Vec<TaskPlan>, SchedulerError> {
        let order = graph.execution_order()?;
        let mut would_run: BTreeSet<&str> = BTreeSet::new();
        let mut plans = Vec::with_capacity(order.len());
        for idx in order {
            let task = &graph.tasks[idx];
            let freshness = match task
                .task_deps
                .iter()
                .find(|d| would_run.contains(d.as_str()))
            {
                Some(pred) => Freshness::Stale(StaleReason::PredecessorRan(pred.clone())),
                None => self.check_freshness(task),
            };
            match freshness {
                Freshness::Fresh => plans.push(TaskPlan {
                    name: task.name.clone(),
                    fresh: true,
                    reason: None,
                }),
                Freshness::Stale(reason) => {
                    would_run.insert(task.name.as_str());
                    plans.push(TaskPlan {
                        name: task.name.clone(),
                        fresh: false,
                        reason: Some(reason.to_string()),
                    });
                }
            }
        }
        Ok(plans)
    }

    /// Execute the graph sequentially in dependency order. Task failures
    /// are recorded in the report; only a malformed graph is an error.
    pub fn run(&self, graph: TaskGraph) -> Result<RunReport, SchedulerError> {
        let order = graph.execution_order()?;
        let started_at = Utc::now().to_rfc3339();
        let mut slots: Vec<Option<Task>> = graph.tasks.into_iter().map(Some).collect();
        let mut states: BTreeMap<String, TaskState> = BTreeMap::new();
        let mut ran: BTreeSet<String> = BTreeSet::new();
        let mut outcomes = Vec::with_capacity(slots.len());

        for idx in order {
            let Some(task) = slots[idx].take() else {
                continue;
            };
            let Task {
                name,
                file_deps,
                targets,
                task_deps,
                action,
            } = task;
            let mut state = TaskState::Pending;

            let blocker = task_deps.iter().find(|d| {
                !states
                    .get(d.as_str())
                    .copied()
                    .map_or(false, TaskState::is_complete)
            });
            if let Some(blocker) = blocker {
                warn!(task = %name, blocked_by = %blocker, "predecessor did not complete; not running");
                outcomes.push(TaskOutcome {
                    name: name.clone(),
                    status: TaskStatus::Blocked {
                        by: blocker.clone(),
                    },
                    reason: None,
                    elapsed_ms: 0,
                });
                states.insert(name, state);
                continue;
            }

            let freshness = match task_deps.iter().find(|d| ran.contains(d.as_str())) {
                Some(pred) => Freshness::Stale(StaleReason::PredecessorRan(pred.clone())),
                None => self.freshness_of(&file_deps, &targets),
            };

            match freshness {
                Freshness::Fresh => {
                    advance(&name, &mut state, TaskState::Fresh)?;
                    advance(&name, &mut state, TaskState::Skipped)?;
                    debug!(task = %name, "up to date");
                    outcomes.push(TaskOutcome {
                        name: name.clone(),
                        status: TaskStatus::Skipped,
                        reason: None,
                        elapsed_ms: 0,
                    });
                }
                Freshness::Stale(reason) => {
                    advance(&name, &mut state, TaskState::Stale)?;
                    advance(&name, &mut state, TaskState::Running)?;
                    info!(task = %name, reason = %reason, "running");
                    let started = Instant::now();
                    let result = invoke(action).and_then(|()| self.finalize_targets(&targets));
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    ran.insert(name.clone());
                    let status = match result {
                        Ok(()) => {
                            advance(&name, &mut state, TaskState::Done)?;
                            info!(task = %name, elapsed_ms, "done");
                            TaskStatus::Done
                        }
                        Err(err) => {
                            advance(&name, &mut state, TaskState::Failed)?;
                            let error = format!("{:#}", err);
                            error!(task = %name, error = %error, "failed");
                            TaskStatus::Failed { error }
                        }
                    };
                    outcomes.push(TaskOutcome {
                        name: name.clone(),
                        status,
                        reason: Some(reason.to_string()),
                        elapsed_ms,
                    });
                }
            }
            states.insert(name, state);
        }

        Ok(RunReport {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            outcomes,
        })
    }

    fn finalize_targets(&self, targets: &[Target]) -> anyhow::Result<()> {
        for target in targets {
            match target {
                Target::Marker(path) => self.store.touch_marker(path)?,
                Target::File(path) => {
                    if !self.store.exists(path) {
                        return Err(anyhow!(
                            "action finished without producing target {}",
                            path.display()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn advance(name: &str, state: &mut TaskState, next: TaskState) -> Result<(), SchedulerError> {
    if !state.can_transition_to(next) {
        return Err(SchedulerError::IllegalTransition {
            task: name.to_string(),
            from: *state,
            to: next,
        });
    }
    *state = next;
    Ok(())
}

fn invoke(action: Action) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("task panicked: {}", msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    #[derive(Default)]
    struct MemoryTargetStore {
        clock: AtomicU64,
        files: Mutex<BTreeMap<PathBuf, SystemTime>>,
    }

    impl MemoryTargetStore {
        fn write(&self, path: &str) {
            let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
            self.files.lock().expect("lock").insert(
                PathBuf::from(path),
                SystemTime::UNIX_EPOCH + Duration::from_secs(tick),
            );
        }
    }

    impl TargetStore for MemoryTargetStore {
        fn exists(&self, path: &Path) -> bool {
            self.files.lock().expect("lock").contains_key(path)
        }

        fn modified_at(&self, path: &Path) -> anyhow::Result<Option<SystemTime>> {
            Ok(self.files.lock().expect("lock").get(path).copied())
        }

        fn touch_marker(&self, path: &Path) -> anyhow::Result<()> {
            self.write(path.to_str().expect("utf8 path"));
            Ok(())
        }
    }

    fn counting_task(name: &str, counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Task::new(name, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn transitions_follow_the_task_lifecycle() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Stale));
        assert!(Pending.can_transition_to(Fresh));
        assert!(Stale.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Failed));
        assert!(Fresh.can_transition_to(Skipped));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Fresh.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Done));
        assert!(!Done.can_transition_to(Running));
    }

    #[test]
    fn fresh_task_is_skipped_and_stale_task_runs() {
        let store = Arc::new(MemoryTargetStore::default());
        store.write("in.csv");
        store.write("out.archive");
        let counter = Arc::new(AtomicUsize::new(0));

        let mut graph = TaskGraph::new();
        graph
            .add(
                counting_task("convert", &counter)
                    .file_dep("in.csv")
                    .target(Target::File("out.archive".into())),
            )
            .expect("add");
        let scheduler = Scheduler::new(Arc::clone(&store));
        let report = scheduler.run(graph).expect("run");
        assert_eq!(report.skipped(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        store.write("in.csv");
        let mut graph = TaskGraph::new();
        graph
            .add(
                counting_task("convert", &counter)
                    .file_dep("in.csv")
                    .target(Target::File("out.archive".into())),
            )
            .expect("add");
        let report = scheduler.run(graph).expect("run");
        assert_eq!(report.done(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(report
            .outcome("convert")
            .and_then(|o| o.reason.clone())
            .expect("reason")
            .contains("older than"));
    }

    #[test]
    fn missing_dependency_and_no_targets_mean_stale() {
        let store = MemoryTargetStore::default();
        store.write("out");
        let scheduler = Scheduler::new(store);
        let task = Task::new("t", || Ok(()))
            .file_dep("gone.csv")
            .target(Target::File("out".into()));
        assert_eq!(
            scheduler.check_freshness(&task),
            Freshness::Stale(StaleReason::MissingDependency("gone.csv".into()))
        );
        let untargeted = Task::new("u", || Ok(()));
        assert_eq!(
            scheduler.check_freshness(&untargeted),
            Freshness::Stale(StaleReason::NoTargets)
        );
    }

    #[test]
    fn equal_timestamps_count_as_fresh() {
        let store = MemoryTargetStore::default();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        {
            let mut files = store.files.lock().expect("lock");
            files.insert("dep".into(), t);
            files.insert("out".into(), t);
        }
        let scheduler = Scheduler::new(store);
        let task = Task::new("t", || Ok(()))
            .file_dep("dep")
            .target(Target::File("out".into()));
        assert_eq!(scheduler.check_freshness(&task), Freshness::Fresh);
    }

    #[test]
    fn executor_writes_markers_only_after_success() {
        let store = Arc::new(MemoryTargetStore::default());
        store.write("archive");
        let mut graph = TaskGraph::new();
        graph
            .add(
                Task::new("ok", || Ok(()))
                    .file_dep("archive")
                    .target(Target::Marker("ok.txt".into())),
            )
            .expect("add");
        graph
            .add(
                Task::new("bad", || Err(anyhow!("no log found")))
                    .file_dep("archive")
                    .target(Target::Marker("bad.txt".into())),
            )
            .expect("add");
        let report = Scheduler::new(Arc::clone(&store)).run(graph).expect("run");
        assert_eq!(report.done(), 1);
        assert_eq!(report.failed(), 1);
        assert!(store.exists(Path::new("ok.txt")));
        assert!(!store.exists(Path::new("bad.txt")));
    }

    #[test]
    fn missing_file_target_after_action_is_a_failure() {
        let store = MemoryTargetStore::default();
        let mut graph = TaskGraph::new();
        graph
            .add(Task::new("lazy", || Ok(())).target(Target::File("never".into())))
            .expect("add");
        let report = Scheduler::new(store).run(graph).expect("run");
        match &report.outcome("lazy").expect("outcome").status {
            TaskStatus::Failed { error } => assert!(error.contains("without producing")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn failed_predecessor_blocks_fresh_successors_transitively() {
        let store = Arc::new(MemoryTargetStore::default());
        store.write("in.csv");
        store.write("b.txt");
        store.write("c.txt");
        let counter = Arc::new(AtomicUsize::new(0));

        let mut graph = TaskGraph::new();
        graph
            .add(
                Task::new("a", || Err(anyhow!("header shape mismatch")))
                    .file_dep("in.csv")
                    .target(Target::File("a.archive".into())),
            )
            .expect("add");
        graph
            .add(
                counting_task("b", &counter)
                    .file_dep("in.csv")
                    .target(Target::Marker("b.txt".into()))
                    .after("a"),
            )
            .expect("add");
        graph
            .add(
                counting_task("c", &counter)
                    .file_dep("in.csv")
                    .target(Target::Marker("c.txt".into()))
                    .after("b"),
            )
            .expect("add");

        let report = Scheduler::new(Arc::clone(&store)).run(graph).expect("run");
        assert_eq!(report.failed(), 1);
        assert_eq!(report.blocked(), 2);
        assert_eq!(report.done(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        match &report.outcome("c").expect("c").status {
            TaskStatus::Blocked { by } => assert_eq!(by, "b"),
            other => panic!("expected blocked, got {:?}", other),
        }
    }

    #[test]
    fn running_predecessor_forces_successor_to_rerun() {
        let store = Arc::new(MemoryTargetStore::default());
        store.write("in.csv");
        store.write("events.txt");
        let counter = Arc::new(AtomicUsize::new(0));
        let producer_store = Arc::clone(&store);

        let mut graph = TaskGraph::new();
        graph
            .add(
                Task::new("convert", move || {
                    producer_store.write("archive");
                    Ok(())
                })
                .file_dep("in.csv")
                .target(Target::File("archive".into())),
            )
            .expect("add");
        graph
            .add(
                counting_task("events", &counter)
                    .file_dep("in.csv")
                    .target(Target::Marker("events.txt".into()))
                    .after("convert"),
            )
            .expect("add");

        let report = Scheduler::new(Arc::clone(&store)).run(graph).expect("run");
        assert_eq!(report.done(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.outcome("events").and_then(|o| o.reason.as_deref()),
            Some("predecessor 'convert' ran")
        );
    }

    #[test]
    fn panicking_action_fails_without_stopping_independent_tasks() {
        let store = MemoryTargetStore::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        graph
            .add(
                Task::new("boom", || -> anyhow::Result<()> { panic!("corrupt row") })
                    .target(Target::Marker("boom.txt".into())),
            )
            .expect("add");
        graph
            .add(counting_task("other", &counter).target(Target::Marker("other.txt".into())))
            .expect("add");
        let report = Scheduler::new(store).run(graph).expect("run");
        assert_eq!(report.failed(), 1);
        assert_eq!(report.done(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        match &report.outcome("boom").expect("boom").status {
            TaskStatus::Failed { error } => assert!(error.contains("corrupt row")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn execution_order_honours_predecessors_added_later() {
        let mut graph = TaskGraph::new();
        graph
            .add(Task::new("settings", || Ok(())).after("events"))
            .expect("add");
        graph
            .add(Task::new("events", || Ok(())).after("convert"))
            .expect("add");
        graph.add(Task::new("convert", || Ok(()))).expect("add");
        graph
            .add(Task::new("orientation", || Ok(())).after("convert"))
            .expect("add");
        let order: Vec<&str> = graph
            .execution_order()
            .expect("order")
            .into_iter()
            .map(|i| graph.tasks[i].name.as_str())
            .collect();
        assert_eq!(order, vec!["convert", "events", "settings", "orientation"]);
    }

    #[test]
    fn malformed_graphs_are_rejected() {
        let mut graph = TaskGraph::new();
        graph.add(Task::new("a", || Ok(()))).expect("add");
        assert!(matches!(
            graph.add(Task::new("a", || Ok(()))),
            Err(SchedulerError::DuplicateTask(_))
        ));

        let mut graph = TaskGraph::new();
        graph.add(Task::new("a", || Ok(())).after("ghost")).expect("add");
        assert!(matches!(
            graph.execution_order(),
            Err(SchedulerError::UnknownPredecessor { .. })
        ));

        let mut graph = TaskGraph::new();
        graph.add(Task::new("a", || Ok(())).after("b")).expect("add");
        graph.add(Task::new("b", || Ok(())).after("a")).expect("add");
        match graph.execution_order() {
            Err(SchedulerError::Cycle(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other.map(|o| o.len())),
        }
    }

    #[test]
    fn plan_marks_downstream_of_stale_tasks_as_stale() {
        let store = MemoryTargetStore::default();
        store.write("in.csv");
        store.write("events.txt");
        let mut graph = TaskGraph::new();
        graph
            .add(
                Task::new("convert", || Ok(()))
                    .file_dep("in.csv")
                    .target(Target::File("archive".into())),
            )
            .expect("add");
        graph
            .add(
                Task::new("events", || Ok(()))
                    .file_dep("in.csv")
                    .target(Target::Marker("events.txt".into()))
                    .after("convert"),
            )
            .expect("add");
        let plan = Scheduler::new(store).plan(&graph).expect("plan");
        assert_eq!(plan.len(), 2);
        assert!(!plan[0].fresh);
        assert_eq!(plan[0].reason.as_deref(), Some("target missing: archive"));
        assert!(!plan[1].fresh);
    }
}
