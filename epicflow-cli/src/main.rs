//! Command-line driver for the epicflow reduction pipeline.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use epicflow::core::ObservationId;
use epicflow::observability::{init_from_env, init_logging, parse_level, LoggingConfig};
use epicflow::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Directory under the data root that receives the batch report by default.
const DEFAULT_REPORT_DIR: &str = "Blank_Sky";

const FAILURE_LINE: &str = "Processing failed!";

/// Reduces EPIC observation archives into spectral products
#[derive(Parser, Debug)]
#[command(name = "epicflow", version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    log_level: Option<String>,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reduce one or more observations
    Run(RunArgs),
    /// Classify every reduced exposure under a data root as completed or bad
    Report(ReportArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(short, long, env = "EPICFLOW_CONFIG", value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "EPICFLOW_DATA_ROOT", value_name = "DIR", help = "Override the configured data root")]
    data_root: Option<PathBuf>,

    #[arg(short, long, default_value_t = 1, help = "Observations reduced concurrently")]
    jobs: usize,

    #[arg(long, help = "Print run reports as JSON")]
    json: bool,

    #[arg(required = true, value_name = "OBS_ID")]
    obs_ids: Vec<ObservationId>,
}

#[derive(Args, Debug, Clone)]
struct ReportArgs {
    #[arg(short, long, env = "EPICFLOW_CONFIG", value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "EPICFLOW_DATA_ROOT", value_name = "DIR", help = "Override the configured data root")]
    data_root: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Where to write the lists (defaults to <data-root>/Blank_Sky)")]
    report_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging_from_args(&args);
    debug!(?args, "epicflow v{} starting", env!("CARGO_PKG_VERSION"));

    let outcome = match &args.command {
        Commands::Run(run_args) => handle_run(run_args).await,
        Commands::Report(report_args) => handle_report(report_args),
    };

    ExitCode::from(exit_status(outcome, &mut std::io::stderr()))
}

/// Maps a command outcome to the process exit status. Errors also print
/// the terminal failure line.
fn exit_status(outcome: anyhow::Result<bool>, err: &mut impl Write) -> u8 {
    match outcome {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            let _ = writeln!(err, "Error: {e:#}");
            let _ = writeln!(err, "{FAILURE_LINE}");
            2
        }
    }
}

fn init_logging_from_args(args: &CliArgs) {
    match (&args.log_level, args.log_json) {
        (None, false) => init_from_env(),
        (level, json) => {
            let base = if json { LoggingConfig::production() } else { LoggingConfig::default() };
            init_logging(&LoggingConfig {
                level: level.as_deref().map_or(base.level, parse_level),
                ..base
            });
        }
    }
}

fn load_config(path: Option<&Path>, data_root: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(root) = data_root {
        config = config.with_data_root(root);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn handle_run(args: &RunArgs) -> anyhow::Result<bool> {
    let config = load_config(args.config.as_deref(), args.data_root.as_deref())?;
    let jobs = args.jobs.max(1);
    let concurrent = jobs > 1 && args.obs_ids.len() > 1;
    if concurrent && config.installation.shared_dir.is_none() {
        bail!("running observations concurrently requires installation.shared_dir");
    }
    let isolate = concurrent || config.installation.isolate;

    let config = Arc::new(config);
    let runner: Arc<dyn ToolRunner> =
        Arc::new(ProcessToolRunner::new().with_timeout(config.stage_timeout()));
    let sink: Arc<dyn EventSink> = Arc::new(LoggingEventSink::debug());
    let permits = Arc::new(Semaphore::new(jobs));
    info!(observations = args.obs_ids.len(), jobs, isolate, "Starting reduction");

    let mut tasks = JoinSet::new();
    for obs_id in args.obs_ids.iter().cloned() {
        let config = Arc::clone(&config);
        let runner = Arc::clone(&runner);
        let sink = Arc::clone(&sink);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            reduce(config, obs_id, runner, sink, isolate).await
        });
    }

    let mut reports = Vec::with_capacity(args.obs_ids.len());
    while let Some(joined) = tasks.join_next().await {
        reports.push(joined.context("reduction task panicked")??);
    }
    reports.sort_by(|a, b| a.obs_id.cmp(&b.obs_id));

    for report in &reports {
        if args.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{report}");
        }
    }
    Ok(reports.iter().all(RunReport::succeeded))
}

async fn reduce(
    config: Arc<PipelineConfig>,
    obs_id: ObservationId,
    runner: Arc<dyn ToolRunner>,
    sink: Arc<dyn EventSink>,
    isolate: bool,
) -> anyhow::Result<RunReport> {
    let installation = match (&config.installation.shared_dir, isolate) {
        (Some(shared), true) => {
            let shared = shared.clone();
            let scratch = config.installation.scratch_root.clone();
            let label = obs_id.to_string();
            let provisioned = tokio::task::spawn_blocking(move || {
                IsolatedInstallation::provision(&shared, &scratch, &label)
            })
            .await
            .context("installation copy panicked")?
            .with_context(|| format!("isolating the tool installation for {obs_id}"))?;
            Some(provisioned)
        }
        _ => None,
    };

    let env = match (&installation, &config.installation.shared_dir) {
        (Some(private), _) => private.environment(),
        (None, Some(shared)) => ToolEnvironment::new().with_installation(shared),
        (None, None) => ToolEnvironment::new(),
    };

    let report = PipelineController::new(config, obs_id, runner)
        .with_environment(env)
        .with_event_sink(sink)
        .run()
        .await;
    drop(installation);
    Ok(report)
}

fn handle_report(args: &ReportArgs) -> anyhow::Result<bool> {
    let config = load_config(args.config.as_deref(), args.data_root.as_deref())?;
    let data_root = &config.data_root;
    let report = ReductionReport::scan(data_root)
        .with_context(|| format!("scanning {}", data_root.display()))?;

    let report_dir = args
        .report_dir
        .clone()
        .unwrap_or_else(|| data_root.join(DEFAULT_REPORT_DIR));
    let (bad, completed) = report.write_to(&report_dir)?;

    println!(
        "{} completed ({}), {} bad ({})",
        report.completed.len(),
        completed.display(),
        report.bad.len(),
        bad.display()
    );
    Ok(true)
}
