//! The external synchronization daemon, driven through its `start`/`stop` subcommands.

use std::{collections::HashMap, future::pending, path::PathBuf, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
	config::{render_args, DaemonCommands},
	error::Error,
	launcher::{launch, run_to_completion, LaunchSpec, LaunchedInstance},
	readiness::{wait_listening, ReadinessCheck},
	unified_log::UnifiedLog,
};

pub const DAEMON_LABEL: &str = "sync-daemon";

#[derive(Debug)]
pub struct SyncDaemon {
	port: u16,
	commands: DaemonCommands,
	vars: HashMap<&'static str, String>,
	workdir: PathBuf,
	/// The `start` invocation, kept when it stays in the foreground
	starter: Option<LaunchedInstance>,
}

#[derive(Debug, Clone, Copy)]
pub struct DaemonTimeouts {
	pub startup: Duration,
	pub poll_interval: Duration,
	pub stop_grace: Duration,
}

impl SyncDaemon {
	pub fn url(&self) -> String {
		server_url(self.port)
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	/// Runs the `start` subcommand and waits for the daemon port to accept connections.
	///
	/// The start command may either daemonize and return, or keep running in the foreground;
	/// only a failing exit aborts the wait early.
	pub async fn start(
		commands: &DaemonCommands,
		port: u16,
		clients: &[String],
		sandbox: PathBuf,
		timeouts: DaemonTimeouts,
		log: &UnifiedLog,
		cancel: &CancellationToken,
	) -> Result<Self, Error> {
		let vars = HashMap::from([
			("port", port.to_string()),
			("clients", clients.join(",")),
			("sandbox", sandbox.display().to_string()),
		]);

		let spec = LaunchSpec::new(DAEMON_LABEL, &commands.program, &sandbox)
			.args(render_args(&commands.start_args, &vars))
			.port(port);

		let mut starter = launch(spec, log).await?;
		let mut starter_exit = starter.exit_watch();

		let check = ReadinessCheck {
			label: DAEMON_LABEL,
			port,
			timeout: timeouts.startup,
			poll_interval: timeouts.poll_interval,
		};

		let failed_start = async {
			match starter_exit.wait_for(|exit| exit.as_ref().is_some_and(|exit| !exit.success())).await {
				Ok(exit) => exit.clone(),
				// A clean exit means it daemonized, keep polling the port
				Err(_) => pending().await,
			}
		};

		let ready = tokio::select! {
			ready = wait_listening(check, None, cancel) => ready,
			Some(exit) = failed_start => Err(crate::readiness::NotReady::Dead(exit)),
		};

		if let Err(not_ready) = ready {
			starter.stop(timeouts.stop_grace).await;
			return Err(not_ready.into_error(&check, log).await);
		}

		info!(port, clients = %vars["clients"], "sync daemon is up");

		Ok(Self {
			port,
			commands: commands.clone(),
			vars,
			workdir: sandbox,
			starter: starter.is_running().then_some(starter),
		})
	}

	/// Runs the `stop` subcommand, then stops the foreground `start` process if there is one.
	pub async fn stop(&mut self, timeouts: DaemonTimeouts, log: &UnifiedLog) -> Result<(), Error> {
		let spec = LaunchSpec::new(format!("{DAEMON_LABEL}:stop"), &self.commands.program, &self.workdir)
			.args(render_args(&self.commands.stop_args, &self.vars));

		let res = match run_to_completion(spec, log, timeouts.startup, timeouts.stop_grace).await {
			Ok(Some(exit)) if exit.success() => Ok(()),
			Ok(Some(exit)) => {
				warn!(port = self.port, %exit, "sync daemon stop command failed");
				Ok(())
			}
			Ok(None) => {
				warn!(port = self.port, "sync daemon stop command timed out");
				Ok(())
			}
			Err(e) => Err(e),
		};

		if let Some(mut starter) = self.starter.take() {
			starter.stop(timeouts.stop_grace).await;
		}

		res
	}
}

pub fn server_url(port: u16) -> String {
	format!("http://127.0.0.1:{port}")
}
