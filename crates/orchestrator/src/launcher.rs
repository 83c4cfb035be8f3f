//! Spawning and supervising background processes.

use std::{
	collections::BTreeMap,
	fmt,
	path::{Path, PathBuf},
	process::{ExitStatus, Stdio},
	time::Duration,
};

use futures::future::join_all;
use tokio::{
	io::{AsyncBufReadExt, AsyncRead, BufReader},
	process::{Child, Command},
	sync::{oneshot, watch},
	task::JoinHandle,
	time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
	error::{Error, FileIOError},
	unified_log::UnifiedLog,
};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a supervised process ended.
#[derive(Debug, Clone)]
pub enum ProcessExit {
	Exited(ExitStatus),
	/// Waiting on the process itself failed
	Lost(String),
}

impl ProcessExit {
	pub fn success(&self) -> bool {
		matches!(self, Self::Exited(status) if status.success())
	}
}

impl fmt::Display for ProcessExit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Exited(status) => write!(f, "{status}"),
			Self::Lost(reason) => write!(f, "lost track of process: {reason}"),
		}
	}
}

/// Resolves to `Some` once the supervised process is gone.
pub type ExitWatch = watch::Receiver<Option<ProcessExit>>;

/// Everything needed to start one named instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
	pub label: String,
	pub program: String,
	pub args: Vec<String>,
	pub env: BTreeMap<String, String>,
	/// Created if missing; each party gets its own so nothing mutable is shared
	pub workdir: PathBuf,
	/// Ports this instance is expected to listen on
	pub ports: Vec<u16>,
	/// Also print captured output on our own stdout
	pub echo: bool,
}

impl LaunchSpec {
	pub fn new(label: impl Into<String>, program: impl Into<String>, workdir: &Path) -> Self {
		Self {
			label: label.into(),
			program: program.into(),
			args: Vec::new(),
			env: BTreeMap::new(),
			workdir: workdir.to_path_buf(),
			ports: Vec::new(),
			echo: false,
		}
	}

	pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.env.insert(key.into(), value.to_string());
		self
	}

	pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
		self.env.extend(vars);
		self
	}

	pub fn port(mut self, port: u16) -> Self {
		self.ports.push(port);
		self
	}

	pub fn echo(mut self, echo: bool) -> Self {
		self.echo = echo;
		self
	}
}

/// A process started by [`launch`], alive until stopped or until it exits on its own.
#[derive(Debug)]
pub struct LaunchedInstance {
	pub label: String,
	pub pid: u32,
	pub ports: Vec<u16>,
	pub log_target: PathBuf,
	exit: ExitWatch,
	stop_tx: Option<oneshot::Sender<Duration>>,
	reaper: Option<JoinHandle<()>>,
}

impl LaunchedInstance {
	pub fn exit_watch(&self) -> ExitWatch {
		self.exit.clone()
	}

	/// `Some` once the process has exited.
	pub fn exit_status(&self) -> Option<ProcessExit> {
		self.exit.borrow().clone()
	}

	pub fn is_running(&self) -> bool {
		self.exit.borrow().is_none()
	}

	/// Waits for the process to exit on its own.
	pub async fn wait(&mut self) -> ProcessExit {
		wait_exit(&mut self.exit).await
	}

	/// Sends SIGTERM to the instance's process group, then SIGKILL after `grace`.
	///
	/// Returns how the process ended. Stopping an already stopped instance is a no-op.
	pub async fn stop(&mut self, grace: Duration) -> ProcessExit {
		if let Some(stop_tx) = self.stop_tx.take() {
			if self.is_running() {
				debug!(label = %self.label, pid = self.pid, "stopping instance");
			}
			stop_tx.send(grace).ok();
		}

		let exit = wait_exit(&mut self.exit).await;

		if let Some(reaper) = self.reaper.take() {
			reaper.await.ok();
		}

		exit
	}

	/// Synchronous last resort used when the run is dropped without cleanup.
	pub fn force_kill(&mut self) {
		if self.is_running() {
			signal_group(self.pid, Signal::Kill);
		}
		self.stop_tx.take();
	}
}

async fn wait_exit(exit: &mut ExitWatch) -> ProcessExit {
	match exit.wait_for(Option::is_some).await {
		Ok(status) => status
			.clone()
			.unwrap_or_else(|| ProcessExit::Lost("no exit status".to_string())),
		Err(_) => ProcessExit::Lost("supervisor task ended".to_string()),
	}
}

/// Spawns `spec` in the background and returns right away, without waiting for readiness.
///
/// The process gets its own process group so stopping it also reaches anything it spawned.
/// Its stdout and stderr are appended to the unified log.
pub async fn launch(spec: LaunchSpec, log: &UnifiedLog) -> Result<LaunchedInstance, Error> {
	tokio::fs::create_dir_all(&spec.workdir)
		.await
		.map_err(|e| FileIOError::from((&spec.workdir, e, "failed to create working directory")))?;

	let mut command = Command::new(&spec.program);
	command
		.args(&spec.args)
		.envs(&spec.env)
		.current_dir(&spec.workdir)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped());

	#[cfg(unix)]
	command.process_group(0);

	let mut child = command.spawn().map_err(|source| Error::Spawn {
		label: spec.label.clone(),
		program: spec.program.clone(),
		source,
	})?;

	let pid = child.id().unwrap_or_default();

	let capture = capture_output(&mut child, &spec.label, log, spec.echo);

	let (exit_tx, exit) = watch::channel(None);
	let (stop_tx, stop_rx) = oneshot::channel();
	let reaper = tokio::spawn(supervise(
		child,
		pid,
		spec.label.clone(),
		capture,
		stop_rx,
		exit_tx,
	));

	info!(
		label = %spec.label,
		pid,
		ports = ?spec.ports,
		program = %spec.program,
		"launched instance",
	);

	Ok(LaunchedInstance {
		label: spec.label,
		pid,
		ports: spec.ports,
		log_target: log.path().to_path_buf(),
		exit,
		stop_tx: Some(stop_tx),
		reaper: Some(reaper),
	})
}

/// Runs a short lived command (e.g. a daemon's `start`/`stop` subcommand) to completion.
///
/// On timeout the command is stopped and `Ok(None)` is returned.
pub async fn run_to_completion(
	spec: LaunchSpec,
	log: &UnifiedLog,
	limit: Duration,
	grace: Duration,
) -> Result<Option<ProcessExit>, Error> {
	let label = spec.label.clone();
	let mut instance = launch(spec, log).await?;

	match timeout(limit, instance.wait()).await {
		Ok(exit) => Ok(Some(exit)),
		Err(_) => {
			warn!(%label, ?limit, "command did not finish in time, stopping it");
			instance.stop(grace).await;
			Ok(None)
		}
	}
}

async fn supervise(
	mut child: Child,
	pid: u32,
	label: String,
	capture: Vec<JoinHandle<()>>,
	mut stop_rx: oneshot::Receiver<Duration>,
	exit_tx: watch::Sender<Option<ProcessExit>>,
) {
	let status = tokio::select! {
		status = child.wait() => status,
		Ok(grace) = &mut stop_rx => terminate(&mut child, pid, grace).await,
	};

	// Last words first, so they are in the log by the time anyone reacts to the exit.
	// Leftover children may keep the pipes open, hence the timeout.
	if timeout(OUTPUT_DRAIN_TIMEOUT, join_all(capture)).await.is_err() {
		debug!(%label, pid, "output still open after exit, not waiting for it");
	}

	let exit = match status {
		Ok(status) => ProcessExit::Exited(status),
		Err(e) => ProcessExit::Lost(e.to_string()),
	};

	debug!(%label, pid, %exit, "instance exited");
	exit_tx.send_replace(Some(exit));
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
	signal_group(pid, Signal::Term);

	match timeout(grace, child.wait()).await {
		Ok(status) => status,
		Err(_) => {
			warn!(pid, ?grace, "instance ignored SIGTERM, killing it");
			signal_group(pid, Signal::Kill);
			child.kill().await.ok();
			child.wait().await
		}
	}
}

fn capture_output(child: &mut Child, label: &str, log: &UnifiedLog, echo: bool) -> Vec<JoinHandle<()>> {
	let mut handles = Vec::with_capacity(2);

	if let Some(stdout) = child.stdout.take() {
		handles.push(tokio::spawn(forward_lines(stdout, label.to_string(), log.clone(), echo)));
	}
	if let Some(stderr) = child.stderr.take() {
		handles.push(tokio::spawn(forward_lines(
			stderr,
			format!("{label}:err"),
			log.clone(),
			echo,
		)));
	}

	handles
}

async fn forward_lines(stream: impl AsyncRead + Unpin, source: String, log: UnifiedLog, echo: bool) {
	let mut lines = BufReader::new(stream).lines();

	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				if echo {
					println!("{line}");
				}
				log.append(&source, &line);
			}
			Ok(None) => break,
			Err(e) => {
				log.append(&source, &format!("<output capture failed: {e}>"));
				break;
			}
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Signal {
	Term,
	Kill,
}

/// Signals the whole process group led by `pid`, falling back to the process alone.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: Signal) {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return;
	};
	if pid <= 0 {
		return;
	}

	let signal = match signal {
		Signal::Term => libc::SIGTERM,
		Signal::Kill => libc::SIGKILL,
	};

	// SAFETY: kill(2) has no memory safety requirements, a stale pid just yields ESRCH
	unsafe {
		if libc::kill(-pid, signal) != 0 {
			libc::kill(pid, signal);
		}
	}
}

/// Signals a single process we did not spawn ourselves.
#[cfg(unix)]
pub(crate) fn signal_process(pid: u32, signal: Signal) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	if pid <= 0 {
		return false;
	}

	let signal = match signal {
		Signal::Term => libc::SIGTERM,
		Signal::Kill => libc::SIGKILL,
	};

	// SAFETY: see `signal_group`
	unsafe { libc::kill(pid, signal) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn signal_process(pid: u32, signal: Signal) -> bool {
	signal_group(pid, signal);
	true
}

#[cfg(not(unix))]
pub(crate) fn signal_group(pid: u32, _signal: Signal) {
	// Without process groups the best we can do is the process itself
	std::process::Command::new("taskkill")
		.args(["/F", "/T", "/PID", &pid.to_string()])
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.status()
		.ok();
}
