//! Teardown of everything a run started.
//!
//! Cleanup is best-effort: a failing step is recorded and the remaining steps still run. It is
//! also idempotent, only the first call on a [`RunContext`] does anything.

use std::{fmt, process::Stdio, time::Duration};

use bv_ports::is_free;
use tokio::{
	io::{AsyncBufReadExt, BufReader},
	process::Command,
	time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
	context::RunContext,
	daemon::DaemonTimeouts,
	launcher::{signal_process, ProcessExit, Signal},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
	Done,
	Skipped(String),
	Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStep {
	pub name: &'static str,
	pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
	/// `false` when cleanup had already run
	pub performed: bool,
	pub steps: Vec<CleanupStep>,
}

impl CleanupReport {
	pub fn failed(&self) -> impl Iterator<Item = &CleanupStep> {
		self.steps
			.iter()
			.filter(|step| matches!(step.outcome, StepOutcome::Failed(_)))
	}

	fn record(&mut self, name: &'static str, outcome: StepOutcome) {
		match &outcome {
			StepOutcome::Done => debug!(step = name, "cleanup step done"),
			StepOutcome::Skipped(why) => debug!(step = name, %why, "cleanup step skipped"),
			StepOutcome::Failed(why) => warn!(step = name, %why, "cleanup step failed"),
		}
		self.steps.push(CleanupStep { name, outcome });
	}
}

impl fmt::Display for StepOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Done => write!(f, "done"),
			Self::Skipped(why) => write!(f, "skipped ({why})"),
			Self::Failed(why) => write!(f, "failed ({why})"),
		}
	}
}

impl RunContext {
	/// Tears the run down. Runs once; later calls return an empty, not performed, report.
	pub async fn cleanup(&mut self) -> CleanupReport {
		let mut report = CleanupReport::default();
		if self.cleaned_up {
			debug!("cleanup already done");
			return report;
		}
		self.cleaned_up = true;
		report.performed = true;

		self.timers.push("cleanup");

		let outcome = match self.watchdog.take() {
			Some(mut watchdog) => {
				let died = watchdog.stop().await;
				if !died.is_empty() {
					warn!(?died, "instances died while the scenario was running");
				}
				StepOutcome::Done
			}
			None => StepOutcome::Skipped("not running".to_string()),
		};
		report.record("stop watchdog", outcome);

		if self.flags.wait {
			self.pause_for_inspection().await;
		}

		if self.flags.preserve {
			info!(
				run_dir = %self.run_dir.display(),
				"leaving every process running, stop them by hand when done"
			);
			report.record("stop instances", StepOutcome::Skipped("--no-cleanup".to_string()));
		} else {
			let outcome = self.stop_instances().await;
			report.record("stop instances", outcome);

			let outcome = self.release_lingering_listeners().await;
			report.record("release lingering listeners", outcome);

			let outcome = match self.log_stream.take() {
				Some(mut stream) => {
					stream.stop().await;
					StepOutcome::Done
				}
				None => StepOutcome::Skipped("not running".to_string()),
			};
			report.record("stop log stream", outcome);

			let outcome = self.stop_daemon().await;
			report.record("stop sync daemon", outcome);

			self.ledger.clear();
		}

		self.timers.pop();
		self.timers.unwind();
		self.log.flush().await;

		report
	}

	async fn pause_for_inspection(&self) {
		println!("Run directory: {}", self.run_dir.display());
		println!("Press Enter to clean up...");

		let mut stdin = BufReader::new(tokio::io::stdin()).lines();
		tokio::select! {
			_ = stdin.next_line() => {}
			() = self.cancel.cancelled() => debug!("pause interrupted"),
		}
	}

	async fn stop_instances(&mut self) -> StepOutcome {
		let grace = self.config.stop_grace;
		let mut failures = Vec::new();

		// Reverse launch order, parties go before the UI they talk to
		while let Some(mut instance) = self.instances.pop() {
			let was_running = instance.is_running();
			let exit = instance.stop(grace).await;
			if was_running {
				debug!(label = %instance.label, pid = instance.pid, %exit, "instance stopped");
			}
			if let ProcessExit::Lost(reason) = exit {
				failures.push(format!("{}: {reason}", instance.label));
			}
		}

		if failures.is_empty() {
			StepOutcome::Done
		} else {
			StepOutcome::Failed(failures.join("; "))
		}
	}

	/// Kills whatever still listens on a port of this run once our own instances are gone.
	async fn release_lingering_listeners(&self) -> StepOutcome {
		// Both have their own teardown step
		let skip = [
			self.log_stream.as_ref().map(|stream| stream.port()),
			self.daemon.as_ref().map(|daemon| daemon.port()),
		];
		let lingering = self
			.ledger
			.ports()
			.into_iter()
			.filter(|port| !skip.contains(&Some(*port)) && !is_free(*port))
			.collect::<Vec<_>>();

		if lingering.is_empty() {
			return StepOutcome::Done;
		}

		let lsof = match which::which("lsof") {
			Ok(lsof) => lsof,
			Err(e) => {
				return StepOutcome::Failed(format!(
					"ports {lingering:?} still in use and lsof is unavailable: {e}"
				));
			}
		};

		let own_pid = std::process::id();
		let mut pids = Vec::new();

		for port in &lingering {
			match Command::new(&lsof)
				.args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
				.stdin(Stdio::null())
				.stderr(Stdio::null())
				.output()
				.await
			{
				Ok(output) => pids.extend(
					String::from_utf8_lossy(&output.stdout)
						.lines()
						.filter_map(|line| line.trim().parse::<u32>().ok())
						.filter(|pid| *pid != own_pid)
						.inspect(|pid| warn!(port, pid, "releasing lingering listener")),
				),
				Err(e) => warn!(port, "failed to run lsof: {e:#?}"),
			}
		}

		pids.sort_unstable();
		pids.dedup();

		for pid in &pids {
			signal_process(*pid, Signal::Term);
		}

		let deadline = Instant::now() + self.config.stop_grace;
		while Instant::now() < deadline && lingering.iter().any(|port| !is_free(*port)) {
			sleep(self.config.poll_interval.min(Duration::from_millis(100))).await;
		}

		for pid in &pids {
			signal_process(*pid, Signal::Kill);
		}

		let still_busy = lingering
			.into_iter()
			.filter(|port| !is_free(*port))
			.collect::<Vec<_>>();

		if still_busy.is_empty() {
			StepOutcome::Done
		} else {
			StepOutcome::Failed(format!("ports {still_busy:?} are still in use"))
		}
	}

	async fn stop_daemon(&mut self) -> StepOutcome {
		let Some(mut daemon) = self.daemon.take() else {
			return StepOutcome::Skipped("not started".to_string());
		};

		let timeouts = DaemonTimeouts {
			startup: self.config.daemon_timeout,
			poll_interval: self.config.poll_interval,
			stop_grace: self.config.stop_grace,
		};

		match daemon.stop(timeouts, &self.log).await {
			Ok(()) => StepOutcome::Done,
			Err(e) => StepOutcome::Failed(e.to_string()),
		}
	}
}
