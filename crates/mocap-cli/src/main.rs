use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mocap_core::TaskStatus;
use mocap_runner::pipeline::{clean_outputs, plan_pipeline, run_pipeline, PipelineContext};
use mocap_runner::{discover_sessions, OverflowPolicy, PipelineConfig};

const DEFAULT_LOG_FILTER: &str = "mocap=info,mocap_runner=info,mocap_core=info";

#[derive(Parser)]
#[command(
    name = "mocap",
    version,
    about = "Convert motion-capture sessions into per-session archives"
)]
struct Cli {
    /// Debug logging unless RUST_LOG is set.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OverflowArg {
    #[value(name = "clamp")]
    Clamp,
    #[value(name = "reject")]
    Reject,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(value: OverflowArg) -> Self {
        match value {
            OverflowArg::Clamp => OverflowPolicy::Clamp,
            OverflowArg::Reject => OverflowPolicy::Reject,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct Selection {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    recordings: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    event_logs: Option<PathBuf>,
    #[arg(long)]
    settings_logs: Option<PathBuf>,
    #[arg(long)]
    discrepancy_log: Option<PathBuf>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    max_name_strip: Option<usize>,
    #[arg(long, value_enum)]
    overflow: Option<OverflowArg>,
}

impl Selection {
    fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => {
                if self.recordings.is_none() {
                    return Err(anyhow!("pass --recordings or --config"));
                }
                PipelineConfig::default()
            }
        };
        if let Some(dir) = &self.recordings {
            config.recordings_dir = dir.clone();
        }
        if let Some(dir) = &self.output {
            config.output_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.event_logs {
            config.event_log_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.settings_logs {
            config.settings_log_dir = Some(dir.clone());
        }
        if let Some(path) = &self.discrepancy_log {
            config.discrepancy_log = Some(path.clone());
        }
        if self.limit.is_some() {
            config.limit = self.limit;
        }
        if let Some(n) = self.max_name_strip {
            config.max_name_strip = n;
        }
        if let Some(policy) = self.overflow {
            config.overflow = policy.into();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Bring every session's archive up to date.
    Run {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        json: bool,
    },
    /// Show which tasks would run, without running them.
    Plan {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        json: bool,
    },
    /// List discovered sessions and their archive paths.
    Sessions {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        json: bool,
    },
    /// Delete sentinel markers and/or archives so their tasks rerun.
    Clean {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        markers: bool,
        #[arg(long)]
        archives: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { DEFAULT_LOG_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { selection, json } => {
            let ctx = PipelineContext::new(selection.load()?);
            let report = run_pipeline(&ctx)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.is_success(),
                    "command": "run",
                    "report": serde_json::to_value(&report)?
                })));
            }
            for outcome in &report.run.outcomes {
                match &outcome.status {
                    TaskStatus::Done => println!("done     {} ({} ms)", outcome.name, outcome.elapsed_ms),
                    TaskStatus::Skipped => println!("skipped  {}", outcome.name),
                    TaskStatus::Failed { error } => println!("failed   {}: {}", outcome.name, error),
                    TaskStatus::Blocked { by } => println!("blocked  {} (after {})", outcome.name, by),
                }
            }
            println!(
                "sessions: {}  done: {}  skipped: {}  failed: {}  blocked: {}",
                report.sessions,
                report.run.done(),
                report.run.skipped(),
                report.run.failed(),
                report.run.blocked()
            );
            if !report.is_success() {
                return Err(anyhow!(
                    "{} task(s) failed, {} blocked",
                    report.run.failed(),
                    report.run.blocked()
                ));
            }
        }
        Commands::Plan { selection, json } => {
            let ctx = PipelineContext::new(selection.load()?);
            let plan = plan_pipeline(&ctx)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "tasks": serde_json::to_value(&plan)?
                })));
            }
            for task in &plan {
                match &task.reason {
                    Some(reason) if !task.fresh => println!("run    {} ({})", task.name, reason),
                    _ => println!("fresh  {}", task.name),
                }
            }
            let stale = plan.iter().filter(|t| !t.fresh).count();
            println!("{} of {} task(s) would run", stale, plan.len());
        }
        Commands::Sessions { selection, json } => {
            let config = selection.load()?;
            let sessions = discover_sessions(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sessions",
                    "sessions": serde_json::to_value(&sessions)?
                })));
            }
            for session in &sessions {
                println!(
                    "{}\t{}\t{}",
                    session.name,
                    session.recording.display(),
                    session.archive_path.display()
                );
            }
        }
        Commands::Clean {
            selection,
            markers,
            archives,
            json,
        } => {
            if !markers && !archives {
                return Err(anyhow!("nothing to clean: pass --markers and/or --archives"));
            }
            let config = selection.load()?;
            let sessions = discover_sessions(&config)?;
            let removed = clean_outputs(&sessions, markers, archives)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clean",
                    "removed": removed
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                })));
            }
            for path in &removed {
                println!("removed {}", path.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Sessions { json, .. }
        | Commands::Clean { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_flags_override_defaults() {
        let cli = Cli::parse_from([
            "mocap",
            "plan",
            "--recordings",
            ".",
            "--limit",
            "5",
            "--overflow",
            "reject",
            "--max-name-strip",
            "3",
        ]);
        let Commands::Plan { selection, json } = cli.command else {
            panic!("expected plan");
        };
        assert!(!json);
        let config = selection.load().expect("config");
        assert_eq!(config.limit, Some(5));
        assert_eq!(config.max_name_strip, 3);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
    }

    #[test]
    fn recordings_or_config_is_required() {
        let cli = Cli::parse_from(["mocap", "sessions", "--json"]);
        assert!(command_json_mode(&cli.command));
        let Commands::Sessions { selection, .. } = cli.command else {
            panic!("expected sessions");
        };
        assert!(selection.load().is_err());
    }

    #[test]
    fn error_payload_shape() {
        let v = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("command_failed"));
    }
}
