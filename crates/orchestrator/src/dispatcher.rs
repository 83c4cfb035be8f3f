//! Sequencing of one scenario run.
//!
//! ```text
//! allocate ports -> start log stream -> start sync daemon -> launch UI -> launch parties
//!     -> hand off to the test runner -> cleanup
//! ```
//!
//! Every port is allocated and written to `ports.json` before the first process starts, and
//! every process is ready before the runner starts. Cleanup always runs, whatever happened.

use std::{collections::HashMap, path::Path};

use bv_ports::{is_free, AllocationError, LoopbackProbe, PortProbe, PortRange};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{
	config::{ConfigError, OrchestratorConfig},
	context::{Party, PortLedger, PortPlan, RunContext},
	daemon::{server_url, DaemonTimeouts, SyncDaemon},
	error::{Error, FileIOError, Result},
	launcher::{launch, LaunchSpec},
	log_stream::LogStream,
	readiness::{wait_listening, NotReady, ReadinessCheck},
	scenario::{Scenario, Topology},
	watchdog::Watchdog,
};

pub const UI_LABEL: &str = "ui";
pub const RUNNER_LABEL: &str = "runner";
pub const LOG_STREAM_LABEL: &str = "log-stream";

/// Port plan of the run, rewritten whenever a launch had to move to another port
pub const PORTS_FILE: &str = "ports.json";

/// Reserves every port `scenario` needs in `ledger`.
///
/// The mesh goes first as it is by far the hardest to place, the single ports then avoid it
/// through the ledger.
pub fn plan_ports(
	ledger: &mut PortLedger,
	probe: &impl PortProbe,
	config: &OrchestratorConfig,
	scenario: Scenario,
	sandbox: &Path,
) -> Result<PortPlan, AllocationError> {
	let spec = scenario.spec();

	let mesh = match spec.topology {
		Topology::Mesh => Some(ledger.pick_mesh(
			probe,
			spec.party_count(),
			config.mesh_ports,
			config.mesh_base,
		)?),
		Topology::Simple => None,
	};

	let ui_port = ledger.pick_port(probe, UI_LABEL, config.ui_ports)?;
	let log_port = ledger.pick_port(probe, LOG_STREAM_LABEL, config.log_ports)?;
	let daemon_port = spec
		.needs_sync_daemon
		.then(|| ledger.pick_port(probe, crate::daemon::DAEMON_LABEL, config.daemon_ports))
		.transpose()?;

	let parties = spec
		.roles
		.iter()
		.copied()
		.enumerate()
		.map(|(index, role)| {
			let label = Scenario::party_label(role);
			let ws_port = ledger.pick_port(probe, format!("{label} ws bridge"), config.ws_ports)?;

			Ok::<_, AllocationError>(Party {
				index,
				role,
				home_dir: sandbox.join(&label),
				label,
				ws_port,
				mesh: mesh.as_ref().map(|mesh| mesh.party(index)),
			})
		})
		.collect::<Result<Vec<_>, AllocationError>>()?;

	Ok(PortPlan {
		ui_port,
		log_port,
		daemon_port,
		mesh,
		parties,
	})
}

/// Runs the scenario of `ctx` from port allocation to cleanup.
///
/// Timings are printed and written to `timings.json` in the run directory before returning.
pub async fn run_scenario(ctx: &mut RunContext) -> Result<()> {
	info!(scenario = %ctx.scenario, run_dir = %ctx.run_dir.display(), "starting scenario");

	ctx.timers.push(format!("scenario {}", ctx.scenario));

	let res = match drive(ctx).await {
		Err(_) if ctx.cancel.is_cancelled() => Err(Error::Interrupted),
		res => res,
	};

	match &res {
		Ok(()) => {
			ctx.timers.pop();
			info!(scenario = %ctx.scenario, "scenario passed");
		}
		Err(e) => {
			error!(scenario = %ctx.scenario, "scenario failed: {e}");
			ctx.log.append("orchestrator", &format!("scenario failed: {e}"));
		}
	}

	let report = ctx.cleanup().await;
	for step in report.failed() {
		warn!(step = step.name, outcome = %step.outcome, "cleanup was incomplete");
	}

	ctx.timers.print_summary();
	let timings = ctx.run_dir.join("timings.json");
	if let Err(e) = ctx.timers.write_json(&timings) {
		warn!("{e}");
	}

	res
}

async fn drive(ctx: &mut RunContext) -> Result<()> {
	// A failing phase is left open on the timer stack, cleanup closes it
	enter_phase(ctx, "allocate ports")?;
	allocate_ports(ctx).await?;
	ctx.timers.pop();

	enter_phase(ctx, "start log stream")?;
	start_log_stream(ctx).await?;
	ctx.timers.pop();

	if ctx.scenario.spec().needs_sync_daemon {
		enter_phase(ctx, "start sync daemon")?;
		start_sync_daemon(ctx).await?;
		ctx.timers.pop();
	}

	enter_phase(ctx, "launch ui")?;
	launch_ui(ctx).await?;
	ctx.timers.pop();

	let parties = ctx.plan.as_ref().map(|plan| plan.parties.len()).unwrap_or_default();
	for index in 0..parties {
		enter_phase(ctx, format!("launch party {index}"))?;
		launch_party(ctx, index).await?;
		ctx.timers.pop();
	}

	enter_phase(ctx, "run tests")?;
	run_tests(ctx).await?;
	ctx.timers.pop();

	Ok(())
}

fn enter_phase(ctx: &mut RunContext, label: impl Into<String>) -> Result<()> {
	ctx.timers.push(label);
	check_cancelled(ctx)
}

fn check_cancelled(ctx: &RunContext) -> Result<()> {
	if ctx.cancel.is_cancelled() {
		Err(Error::Interrupted)
	} else {
		Ok(())
	}
}

async fn allocate_ports(ctx: &mut RunContext) -> Result<()> {
	let spec = ctx.scenario.spec();
	if spec.topology == Topology::Mesh {
		ctx.config.check_mesh_base(spec.party_count())?;
	}

	let sandbox = ctx.sandbox_dir();
	let plan = plan_ports(&mut ctx.ledger, &LoopbackProbe, &ctx.config, ctx.scenario, &sandbox)?;

	for party in &plan.parties {
		tokio::fs::create_dir_all(&party.home_dir)
			.await
			.map_err(|e| FileIOError::from((&party.home_dir, e, "failed to create party home")))?;
	}

	plan.write_json(&ctx.run_dir.join(PORTS_FILE))?;

	info!(
		ui = plan.ui_port,
		log = plan.log_port,
		daemon = ?plan.daemon_port,
		ws = ?plan.parties.iter().map(|p| p.ws_port).collect::<Vec<_>>(),
		mesh_base = ?plan.mesh.map(|mesh| mesh.global_base()),
		"ports allocated",
	);

	ctx.plan = Some(plan);

	Ok(())
}

/// Best-effort: the run goes on without streaming if the stream doesn't come up.
async fn start_log_stream(ctx: &mut RunContext) -> Result<()> {
	let port = plan(ctx)?.log_port;

	let mut stream = match LogStream::start(port, &ctx.log, &ctx.cancel).await {
		Ok(stream) => stream,
		Err(e) => {
			warn!(port, "log stream unavailable, continuing without it: {e}");
			return Ok(());
		}
	};

	let check = ReadinessCheck {
		label: LOG_STREAM_LABEL,
		port,
		timeout: ctx.config.logger_timeout,
		poll_interval: ctx.config.poll_interval,
	};

	match wait_listening(check, None, &ctx.cancel).await {
		Ok(_) => ctx.log_stream = Some(stream),
		Err(NotReady::Cancelled) => {
			stream.stop().await;
			return Err(Error::Interrupted);
		}
		Err(not_ready) => {
			warn!(port, ?not_ready, "log stream not reachable, continuing without it");
			stream.stop().await;
		}
	}

	Ok(())
}

async fn start_sync_daemon(ctx: &mut RunContext) -> Result<()> {
	let plan = plan(ctx)?;
	let Some(port) = plan.daemon_port else {
		return Ok(());
	};
	let clients = plan.parties.iter().map(|party| party.label.clone()).collect::<Vec<_>>();

	let timeouts = DaemonTimeouts {
		startup: ctx.config.daemon_timeout,
		poll_interval: ctx.config.poll_interval,
		stop_grace: ctx.config.stop_grace,
	};

	let daemon = SyncDaemon::start(
		&ctx.config.daemon,
		port,
		&clients,
		ctx.sandbox_dir(),
		timeouts,
		&ctx.log,
		&ctx.cancel,
	)
	.await?;

	ctx.daemon = Some(daemon);

	Ok(())
}

async fn launch_ui(ctx: &mut RunContext) -> Result<()> {
	let port = plan(ctx)?.ui_port;
	let range = ctx.config.ui_ports;
	let command = ctx.config.ui_command.clone();
	let workdir = ctx.config.project_dir.clone();

	let port = launch_until_ready(ctx, UI_LABEL, port, range, |port| {
		LaunchSpec::new(UI_LABEL, resolve_program(&workdir, &command.program), &workdir)
			.args(command.render(&HashMap::from([("port", port.to_string())])))
			.env("UI_PORT", port)
			.port(port)
	})
	.await?;

	if let Some(plan) = ctx.plan.as_mut() {
		if plan.ui_port != port {
			plan.ui_port = port;
			plan.write_json(&ctx.run_dir.join(PORTS_FILE))?;
		}
	}

	Ok(())
}

async fn launch_party(ctx: &mut RunContext, index: usize) -> Result<()> {
	let plan = plan(ctx)?;
	let party = plan.parties[index].clone();
	let mesh = plan.mesh;

	let range = ctx.config.ws_ports;
	let command = ctx.config.gui_command.clone();
	let program = resolve_program(&ctx.config.project_dir, &command.program);
	let daemon_url = ctx.daemon.as_ref().map(SyncDaemon::url);

	let port = launch_until_ready(ctx, &party.label, party.ws_port, range, |port| {
		let party = Party {
			ws_port: port,
			..party.clone()
		};
		let vars = HashMap::from([
			("port", port.to_string()),
			("email", party.label.clone()),
			("home", party.home_dir.display().to_string()),
		]);

		LaunchSpec::new(&party.label, &program, &party.home_dir)
			.args(command.render(&vars))
			.envs(party.env(daemon_url.as_deref(), mesh.as_ref()))
			.port(port)
	})
	.await?;

	if let Some(plan) = ctx.plan.as_mut() {
		if plan.parties[index].ws_port != port {
			plan.parties[index].ws_port = port;
			plan.write_json(&ctx.run_dir.join(PORTS_FILE))?;
		}
	}

	Ok(())
}

/// Launches the instance built by `build` and waits for it to listen on `port`.
///
/// If the instance dies because somebody else grabbed its port meanwhile, a new port is picked
/// and the launch retried, up to `launch_attempts` times in total.
async fn launch_until_ready(
	ctx: &mut RunContext,
	label: &str,
	mut port: u16,
	range: PortRange,
	build: impl Fn(u16) -> LaunchSpec,
) -> Result<u16> {
	let attempts = ctx.config.launch_attempts.max(1);
	let mut attempt = 1;

	loop {
		let instance = launch(build(port), &ctx.log).await?;
		let exit = instance.exit_watch();
		ctx.track(instance);

		let check = ReadinessCheck {
			label,
			port,
			timeout: ctx.config.readiness_timeout,
			poll_interval: ctx.config.poll_interval,
		};

		match wait_listening(check, Some(&exit), &ctx.cancel).await {
			Ok(elapsed) => {
				info!(%label, port, ?elapsed, "instance ready");
				return Ok(port);
			}
			Err(NotReady::Dead(status)) if attempt < attempts && !is_free(port) => {
				let new_port = ctx.ledger.repick(&LoopbackProbe, port, range)?;
				warn!(
					%label,
					port,
					new_port,
					%status,
					attempt,
					"port was taken before the instance could bind it, retrying on another port",
				);
				port = new_port;
				attempt += 1;
			}
			Err(not_ready) => return Err(not_ready.into_error(&check, &ctx.log).await),
		}
	}
}

async fn run_tests(ctx: &mut RunContext) -> Result<()> {
	let plan = plan(ctx)?;
	let spec = ctx.scenario.spec();
	let config = &ctx.config;

	let mut args = config
		.runner_command
		.render(&HashMap::from([("target", spec.runner_target.to_string())]));
	if ctx.flags.interactive {
		args.extend(config.interactive_runner_args.iter().cloned());
	}

	let workdir = config.project_dir.clone();
	let runner = LaunchSpec::new(
		RUNNER_LABEL,
		resolve_program(&workdir, &config.runner_command.program),
		&workdir,
	)
	.args(args)
	.envs(runner_env(ctx, plan))
	.echo(true);

	let watched = ctx
		.instances
		.iter()
		.map(|instance| (instance.label.clone(), instance.exit_watch()))
		.collect();
	ctx.watchdog = Some(Watchdog::spawn(watched, &ctx.log, &ctx.cancel));

	let limit = config.runner_timeout;
	let grace = config.stop_grace;
	let target = spec.runner_target.to_string();

	let mut runner = launch(runner, &ctx.log).await?;
	let waited = tokio::select! {
		res = timeout(limit, runner.wait()) => Some(res),
		() = ctx.cancel.cancelled() => None,
	};

	let res = match waited {
		Some(Ok(exit)) if exit.success() => Ok(()),
		Some(Ok(exit)) => Err(Error::RunnerFailed {
			target,
			status: exit.to_string(),
		}),
		Some(Err(_)) => {
			runner.stop(grace).await;
			Err(Error::RunnerTimedOut {
				target,
				timeout: limit,
			})
		}
		None => {
			runner.stop(grace).await;
			Err(Error::Interrupted)
		}
	};

	ctx.track(runner);

	res
}

fn runner_env(ctx: &RunContext, plan: &PortPlan) -> Vec<(String, String)> {
	let mut env = vec![
		("UI_PORT".to_string(), plan.ui_port.to_string()),
		("UI_BASE_URL".to_string(), format!("http://localhost:{}", plan.ui_port)),
		("LOG_PORT".to_string(), plan.log_port.to_string()),
		("SCENARIO".to_string(), ctx.scenario.to_string()),
		("UNIFIED_LOG".to_string(), ctx.log.path().display().to_string()),
		("BV_PARTIES".to_string(), plan.parties.len().to_string()),
		(
			"INTERACTIVE_MODE".to_string(),
			u8::from(ctx.flags.interactive).to_string(),
		),
	];

	for party in &plan.parties {
		env.push((format!("BV_PARTY_{}_EMAIL", party.index), party.label.clone()));
		env.push((format!("BV_PARTY_{}_WS_PORT", party.index), party.ws_port.to_string()));
	}

	if let Some(port) = plan.daemon_port {
		env.push(("SYFTBOX_SERVER_URL".to_string(), server_url(port)));
	}

	if let Some(mesh) = plan.mesh {
		env.push(("BV_MESH_BASE".to_string(), mesh.global_base().to_string()));
	}

	env
}

fn plan(ctx: &RunContext) -> Result<&PortPlan> {
	ctx.plan
		.as_ref()
		.ok_or_else(|| ConfigError::Invalid("ports were not allocated".to_string()).into())
}

/// Relative program paths like `./target/debug/app` are taken relative to `workdir`, bare
/// names are left to the `PATH` lookup.
fn resolve_program(workdir: &Path, program: &str) -> String {
	let path = Path::new(program);
	if path.is_relative() && path.components().count() > 1 {
		workdir.join(path).to_string_lossy().into_owned()
	} else {
		program.to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;

	fn all_free(_: u16) -> bool {
		true
	}

	#[test]
	fn two_party_plan_stays_in_range_and_never_repeats_a_port() {
		let config = OrchestratorConfig::default();
		let mut ledger = PortLedger::new();

		let plan = plan_ports(
			&mut ledger,
			&all_free,
			&config,
			Scenario::Messaging,
			Path::new("/tmp/sandbox"),
		)
		.unwrap();

		assert!((8082..=8999).contains(&plan.ui_port));
		assert_eq!(plan.parties.len(), 2);
		assert_ne!(plan.parties[0].ws_port, plan.parties[1].ws_port);
		assert!(plan.daemon_port.is_some());
		assert!(plan.mesh.is_none());

		let ports = ledger.ports();
		assert_eq!(ports.len(), 5);
		assert_eq!(plan.parties[1].home_dir, Path::new("/tmp/sandbox/client2@sandbox.local"));
	}

	#[test]
	fn mesh_plan_never_overlaps_the_other_ports() {
		let mut config = OrchestratorConfig::default();
		// Make the single port ranges overlap the mesh on purpose
		config.mesh_ports = PortRange::new(20000, 20000).unwrap();
		config.ui_ports = PortRange::new(20000, 20010).unwrap();
		config.ws_ports = PortRange::new(20000, 20010).unwrap();
		config.log_ports = PortRange::new(30000, 30010).unwrap();

		let mut ledger = PortLedger::new();
		let plan = plan_ports(
			&mut ledger,
			&all_free,
			&config,
			Scenario::SyqureMultiparty,
			Path::new("/tmp/sandbox"),
		)
		.unwrap();

		let mesh = plan.mesh.unwrap();
		let mesh_ports = mesh.all_ports().into_iter().collect::<HashSet<_>>();
		let mut single = vec![plan.ui_port, plan.log_port];
		single.extend(plan.parties.iter().map(|p| p.ws_port));

		assert!(single.iter().all(|port| !mesh_ports.contains(port)));
		assert_eq!(plan.parties[2].mesh.as_ref().unwrap().control_port, 32000);
	}

	#[test]
	fn exhausted_ranges_fail_the_plan() {
		let mut config = OrchestratorConfig::default();
		config.ws_ports = PortRange::new(3333, 3333).unwrap();

		let res = plan_ports(
			&mut PortLedger::new(),
			&all_free,
			&config,
			Scenario::Messaging,
			Path::new("/tmp/sandbox"),
		);

		assert!(matches!(res, Err(AllocationError::RangeExhausted { .. })));
	}

	#[test]
	fn relative_programs_resolve_against_the_workdir() {
		let workdir = Path::new("/project");

		assert_eq!(
			resolve_program(workdir, "./src-tauri/target/debug/bv-desktop"),
			"/project/./src-tauri/target/debug/bv-desktop"
		);
		assert_eq!(resolve_program(workdir, "npx"), "npx");
		assert_eq!(resolve_program(workdir, "/bin/sh"), "/bin/sh");
	}
}
