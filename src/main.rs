use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use reportrunner::archive::{self, VerifyStatus};
use reportrunner::config::{ReportMode, RunnerConfig};
use reportrunner::scheduler::{Schedule, Trigger};
use reportrunner::workspace;

#[derive(Parser)]
#[command(
    name = "reportrunner",
    about = "Scheduled runner for a report-producing job",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $REPORTRUNNER_CONFIG, then /etc/reportrunner/reportrunner.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + API server)
    Serve,

    /// Run the job once, now
    Run {
        /// Report mode: production or development
        #[arg(long)]
        mode: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    History {
        /// Number of runs to show
        #[arg(long, default_value = "10")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one run and its artifacts
    Show {
        /// Run number
        number: u64,

        #[arg(long)]
        json: bool,
    },

    /// Re-fingerprint the archived artifacts of a run
    Verify {
        /// Run number
        number: u64,
    },

    /// Preview the next scheduled ticks
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "168")]
        hours: u64,

        /// Show the next N ticks instead of a time window
        #[arg(long)]
        count: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RunnerConfig> {
    let config = match path {
        Some(p) => RunnerConfig::load(p)?,
        None => RunnerConfig::load_or_default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve => {
            tracing::info!(bind = %config.server.bind, "Starting reportrunner daemon");
            reportrunner::serve(config).await?;
        }
        Commands::Run { mode, json } => {
            let mode = match mode {
                Some(m) => m.parse::<ReportMode>()?,
                None => config.report.mode,
            };
            let runner = reportrunner::build_runner(Arc::new(config))?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, aborting run");
                    on_signal.cancel();
                }
            });

            let Some(summary) = runner.run_once(Trigger::Manual, mode, cancel).await? else {
                eprintln!("Another run is active; nothing started.");
                std::process::exit(2);
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\n=== Run #{} ===", summary.number);
                println!("Status:    {}", summary.status);
                if let Some(f) = &summary.failure {
                    println!("Step:      {}", f.step);
                    println!("Class:     {}", f.class);
                    println!("Error:     {}", f.message);
                    println!("Notified:  {}", if summary.notified { "yes" } else { "no" });
                }
                println!("Log:       {}", summary.log_path.display());
                println!("\nArtifacts:");
                if summary.artifacts.is_empty() {
                    println!(" (none)");
                }
                for a in &summary.artifacts {
                    println!(" - {} ({} bytes)\n   sha256 {}", a.relative_path, a.size_bytes, a.sha256);
                }
                println!();
            }
            if !summary.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::History { limit, json } => {
            let runner = reportrunner::build_runner(Arc::new(config))?;
            let runs = runner.history().list(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                println!("{:<6} | {:<9} | {:<11} | {:<25} | Failed step", "Run", "Trigger", "Status", "Started");
                println!("{:-<6}-|-{:-<9}-|-{:-<11}-|-{:-<25}-|-{:-<20}", "", "", "", "", "");
                for r in runs {
                    println!(
                        "{:<6} | {:<9} | {:<11} | {:<25} | {}",
                        format!("#{}", r.number),
                        r.trigger.as_str(),
                        r.status.as_str(),
                        r.started_at.to_rfc3339(),
                        r.failed_step.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Show { number, json } => {
            let runner = reportrunner::build_runner(Arc::new(config))?;
            let run = runner
                .history()
                .get(number)
                .await?
                .with_context(|| format!("run #{} not found", number))?;
            let artifacts = runner.history().artifacts(number).await?;
            if json {
                let out = serde_json::json!({ "run": run, "artifacts": artifacts });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Run:       #{} ({})", run.number, run.run_id);
                println!("Job:       {}", run.job);
                println!("Trigger:   {}", run.trigger.as_str());
                println!("Mode:      {}", run.mode);
                println!("Status:    {}", run.status);
                println!("Started:   {}", run.started_at.to_rfc3339());
                if let Some(t) = run.finished_at {
                    println!("Finished:  {}", t.to_rfc3339());
                }
                if let Some(step) = &run.failed_step {
                    println!("Step:      {}", step);
                }
                if let Some(class) = run.error_class {
                    println!("Class:     {}", class);
                }
                if let Some(msg) = &run.error_message {
                    println!("Error:     {}", msg);
                }
                println!("Log:       {}", run.log_path.display());
                for a in artifacts {
                    println!(" - {} ({} bytes) sha256 {}", a.relative_path, a.size_bytes, a.sha256);
                }
            }
        }
        Commands::Verify { number } => {
            let runs_dir = config.storage.runs_dir.clone();
            let runner = reportrunner::build_runner(Arc::new(config))?;
            let artifacts = runner.history().artifacts(number).await?;
            if artifacts.is_empty() {
                println!("Run #{} has no recorded artifacts.", number);
                return Ok(());
            }
            let dest = workspace::artifacts_dir(&runs_dir, number);
            let mut intact = true;
            for a in &artifacts {
                let status = archive::verify(&dest, a);
                intact &= status == VerifyStatus::Ok;
                println!("{:<8} {}", status.to_string(), a.relative_path);
            }
            if !intact {
                std::process::exit(1);
            }
        }
        Commands::DryRun { hours, count } => {
            let schedule = Schedule::from_config(&config.schedule)?;
            let now = Utc::now();
            let ticks = match count {
                Some(n) => schedule.upcoming(now, n),
                None => schedule.preview(now, hours),
            };
            if !config.schedule.enabled {
                println!("Schedule is disabled; ticks below would not fire.");
            }
            if ticks.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!(
                    "Upcoming runs of '{}' ({} in {}):",
                    config.job.name,
                    schedule.expression(),
                    schedule.timezone()
                );
                for t in ticks {
                    println!("{}", t.to_rfc3339());
                }
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
