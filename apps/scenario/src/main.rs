use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use bv_orchestrator::{
	prepare_run_dir, run_scenario, Error, OrchestratorConfig, RunContext, RunFlags, Scenario,
	Topology, UnifiedLog,
};
use clap::Parser;
use owo_colors::OwoColorize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "bv_orchestrator=info,bv_ports=info,bv_scenario=info";

#[derive(Parser, Debug)]
#[command(name = "bv-scenario", about = "Run one end-to-end scenario against freshly launched services")]
struct Cli {
	/// Scenario to run, see --list
	#[arg(required_unless_present = "list")]
	scenario: Option<String>,

	/// Run the test runner headed
	#[arg(long)]
	interactive: bool,

	/// Leave every launched process running afterwards
	#[arg(long)]
	no_cleanup: bool,

	/// Pause before cleaning up until Enter is pressed
	#[arg(long)]
	wait: bool,

	/// TOML file overriding the built-in defaults
	#[arg(long, env = "BV_SCENARIO_CONFIG")]
	config: Option<PathBuf>,

	/// Where run directories are created
	#[arg(long)]
	run_root: Option<PathBuf>,

	/// List the known scenarios and exit
	#[arg(long)]
	list: bool,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let code = match run(cli).await {
		Ok(()) => 0,
		Err(e) => {
			eprintln!("{} {e:#}", "error:".bright_red().bold());
			e.downcast_ref::<Error>().map_or(1, Error::exit_code)
		}
	};

	std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	if cli.list {
		print_catalogue();
		return Ok(());
	}

	let mut config = OrchestratorConfig::load(cli.config.as_deref()).map_err(Error::from)?;
	if let Some(run_root) = cli.run_root {
		config.run_root = run_root;
	}

	let name = cli.scenario.unwrap_or_default();
	let scenario = Scenario::select(&name).map_err(Error::from)?;

	let run_dir = prepare_run_dir(&config, scenario).map_err(Error::from)?;
	let (log, _writer) = UnifiedLog::open(run_dir.join("logs").join("unified.log"))
		.await
		.map_err(Error::from)?;

	let guard = init_tracing(&log)?;

	info!(%scenario, run_dir = %run_dir.display(), log = %log.path().display(), "run prepared");

	let cancel = CancellationToken::new();
	let signals = tokio::spawn(forward_signals(cancel.clone()));

	let flags = RunFlags {
		interactive: cli.interactive,
		preserve: cli.no_cleanup,
		wait: cli.wait,
	};

	let mut ctx = RunContext::new(Arc::new(config), scenario, flags, run_dir, log, cancel);
	let res = run_scenario(&mut ctx).await;

	signals.abort();

	match &res {
		Ok(()) => println!("{} {scenario} passed", "✓".bright_green()),
		Err(_) => println!(
			"{} {scenario} failed, logs in {}",
			"✗".bright_red(),
			ctx.log.path().display()
		),
	}

	// Lines still queued in the tracing worker go to the log writer on drop
	drop(guard);
	ctx.log.flush().await;

	res.map_err(Into::into)
}

fn init_tracing(log: &UnifiedLog) -> anyhow::Result<WorkerGuard> {
	let (file_writer, guard) = tracing_appender::non_blocking(log.sink());

	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
		.with(fmt::layer().with_target(true).with_writer(std::io::stdout))
		.with(
			fmt::layer()
				.with_target(true)
				.with_ansi(false)
				.with_writer(file_writer),
		)
		.try_init()
		.context("failed to initialize tracing")?;

	Ok(guard)
}

/// Turns the first Ctrl+C or SIGTERM into a cancellation of the run.
async fn forward_signals(cancel: CancellationToken) {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			warn!("failed to listen for Ctrl+C: {e:#?}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(e) => {
				warn!("failed to listen for SIGTERM: {e:#?}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => warn!("received Ctrl+C, cleaning up"),
		() = terminate => warn!("received SIGTERM, cleaning up"),
	}

	cancel.cancel();
}

fn print_catalogue() {
	println!("{}", "Scenarios".bright_cyan().bold());

	for scenario in Scenario::all() {
		let spec = scenario.spec();
		let topology = match spec.topology {
			Topology::Simple => "simple",
			Topology::Mesh => "mesh",
		};

		println!(
			"  {:<20} {} {} {}",
			scenario.to_string().bold(),
			format!("{} parties,", spec.party_count()).dimmed(),
			topology.dimmed(),
			if spec.needs_sync_daemon {
				"+ sync daemon".dimmed().to_string()
			} else {
				String::new()
			}
		);
	}
}
