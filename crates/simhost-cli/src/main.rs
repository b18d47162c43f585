//! simhost command line.
//!
//! `simhost run` supervises one worker in the foreground until it exits or the
//! host receives SIGINT/SIGTERM. The other subcommands inspect or talk to runs
//! through their run directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use simhost::config::SIMULATION_CONFIG_FILE;
use simhost::{
    ActionFilter, ForwarderConfig, LaunchSpec, ProcessSupervisor, RunHistory, RunStatus,
    SimulationConfig, SupervisorConfig, install_shutdown_hook,
};

#[derive(Parser, Debug)]
#[command(name = "simhost", version = simhost::SIMHOST_VERSION, about = "Supervise simulation workers")]
struct Cli {
    /// Parent directory of run directories (default: $SIMHOST_RUNS_DIR or ./simulations)
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a worker and supervise it until it exits
    Run(RunArgs),
    /// Print the stored state of a run
    Status {
        run_id: String,
        /// Print the compact summary instead of the full state
        #[arg(long)]
        summary: bool,
    },
    /// Ask one agent a question
    Interview {
        run_id: String,
        #[arg(long)]
        agent: u64,
        #[arg(long)]
        prompt: String,
        /// Channel to ask; every available channel when omitted
        #[arg(long)]
        platform: Option<String>,
        /// Seconds to wait for the answer
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Ask every agent the same question in one batch
    InterviewAll {
        run_id: String,
        #[arg(long)]
        prompt: String,
        /// Agent ids; all agents in the simulation config when omitted
        #[arg(long, value_delimiter = ',')]
        agents: Vec<u64>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Ask the worker to close its environment
    CloseEnv {
        run_id: String,
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Delete run artifacts, keeping configuration and profiles
    Cleanup { run_id: String },
    /// List recorded actions, newest first
    Actions {
        run_id: String,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        agent: Option<u64>,
        #[arg(long)]
        round: Option<u32>,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Per-round action counts
    Timeline {
        run_id: String,
        #[arg(long, default_value = "0")]
        start: u32,
        #[arg(long)]
        end: Option<u32>,
    },
    /// Per-agent action counts
    AgentStats { run_id: String },
    /// Past interviews recorded by the worker, newest first
    InterviewHistory {
        run_id: String,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        agent: Option<u64>,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    run_id: String,

    /// Platform the worker drives; repeat for several
    #[arg(long = "platform", required = true)]
    platforms: Vec<String>,

    /// Cap on the number of rounds
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Simulation config path, relative to the run directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// POST batches of agent activity to this URL
    #[arg(long)]
    forward_url: Option<String>,

    #[arg(long, default_value = "5")]
    forward_batch: usize,

    /// Worker program followed by its arguments
    #[arg(last = true, required = true)]
    worker: Vec<String>,
}

/// `RUST_LOG` wins outright. Otherwise `-v` flags pick the level, falling back
/// to `SIMHOST_LOG`; per-poll mailbox traces only show with `-vv`.
fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => match std::env::var("SIMHOST_LOG").as_deref() {
                Ok("debug") => "debug",
                Ok("trace") => "trace",
                Ok("warn") | Ok("warning") => "warn",
                Ok("error") => "error",
                _ => "info",
            },
            1 => "debug",
            _ => "trace",
        };
        let mailbox = if level == "trace" && verbose < 2 { "debug" } else { level };
        EnvFilter::new(format!(
            "simhost={level},simhost_cli={level},simhost::ipc::mailbox={mailbox}"
        ))
    });

    let layer = fmt::layer().with_writer(std::io::stderr).with_target(verbose > 0);
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn seconds(timeout: Option<f64>) -> Option<Duration> {
    timeout.filter(|s| *s > 0.0).map(Duration::from_secs_f64)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = match cli.runs_dir {
        Some(root) => SupervisorConfig::new(root),
        None => SupervisorConfig::default(),
    };

    match cli.command {
        Commands::Run(args) => return run(config, args).await,
        Commands::Status { run_id, summary } => {
            let supervisor = ProcessSupervisor::new(config);
            let state = supervisor
                .state(&run_id)?
                .with_context(|| format!("no state recorded for run {run_id}"))?;
            if summary {
                print_json(&state.to_summary())?;
            } else {
                print_json(&state)?;
            }
        }
        Commands::Interview {
            run_id,
            agent,
            prompt,
            platform,
            timeout,
        } => {
            let coordinator = ProcessSupervisor::new(config).interviews(&run_id)?;
            let answer = coordinator
                .interview(agent, &prompt, platform.as_deref(), seconds(timeout))
                .await?;
            print_json(&answer)?;
        }
        Commands::InterviewAll {
            run_id,
            prompt,
            agents,
            platform,
            timeout,
        } => {
            let agents = if agents.is_empty() {
                let path = config.run_dir(&run_id).join(SIMULATION_CONFIG_FILE);
                SimulationConfig::load(&path)
                    .with_context(|| format!("reading {}", path.display()))?
                    .agent_ids()
            } else {
                agents
            };
            if agents.is_empty() {
                bail!("no agents to interview");
            }
            let coordinator = ProcessSupervisor::new(config).interviews(&run_id)?;
            let outcome = coordinator
                .interview_all(&agents, &prompt, platform.as_deref(), seconds(timeout))
                .await?;
            print_json(&outcome)?;
        }
        Commands::CloseEnv { run_id, timeout } => {
            let coordinator = ProcessSupervisor::new(config).interviews(&run_id)?;
            let outcome = coordinator.close_env(seconds(timeout)).await?;
            print_json(&outcome)?;
        }
        Commands::Cleanup { run_id } => {
            let report = ProcessSupervisor::new(config).cleanup_logs(&run_id)?;
            print_json(&report)?;
            if !report.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Actions {
            run_id,
            platform,
            agent,
            round,
            offset,
            limit,
        } => {
            let history = RunHistory::discover(config.run_dir(&run_id))?;
            let filter = ActionFilter {
                platform,
                agent_id: agent,
                round,
            };
            print_json(&history.page(&filter, offset, limit)?)?;
        }
        Commands::Timeline { run_id, start, end } => {
            let history = RunHistory::discover(config.run_dir(&run_id))?;
            print_json(&history.timeline(start, end)?)?;
        }
        Commands::AgentStats { run_id } => {
            let history = RunHistory::discover(config.run_dir(&run_id))?;
            print_json(&history.agent_stats()?)?;
        }
        Commands::InterviewHistory {
            run_id,
            platform,
            agent,
            limit,
        } => {
            let history = RunHistory::discover(config.run_dir(&run_id))?;
            print_json(&history.interviews(platform.as_deref(), agent, limit))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(config: SupervisorConfig, args: RunArgs) -> Result<ExitCode> {
    let (program, worker_args) = args
        .worker
        .split_first()
        .context("worker program is required")?;

    let mut spec = LaunchSpec::new(program).args(worker_args.iter().cloned());
    for platform in &args.platforms {
        spec = spec.platform(platform.clone());
    }
    if let Some(path) = args.config {
        spec = spec.with_config_file(path);
    }
    if let Some(url) = args.forward_url {
        spec = spec.with_forwarder(ForwarderConfig::new(url).with_batch_size(args.forward_batch));
    }

    let supervisor = ProcessSupervisor::new(config);
    let mut hook = install_shutdown_hook(supervisor.clone());

    let started = supervisor.start(&args.run_id, spec, args.max_rounds).await?;
    tracing::info!(
        run_id = %started.run_id,
        pid = ?started.process_pid,
        total_rounds = started.total_rounds,
        "Supervising worker"
    );

    tokio::select! {
        exit = supervisor.wait(&args.run_id) => {
            if let Some(exit) = exit {
                tracing::info!(exit = %exit.describe(), "Worker finished");
            }
            hook.abort();
        }
        _ = &mut hook => {
            tracing::info!("Shutdown signal handled");
        }
    }

    let state = supervisor
        .state(&args.run_id)?
        .with_context(|| format!("state for run {} disappeared", args.run_id))?;
    print_json(&state.to_summary())?;

    Ok(match state.status {
        RunStatus::Completed | RunStatus::Stopped => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
