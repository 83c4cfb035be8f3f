use std::{
	net::{Ipv4Addr, SocketAddrV4},
	time::Duration,
};

use tokio::{
	net::TcpStream,
	time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
	error::Error,
	launcher::{ExitWatch, ProcessExit},
	unified_log::UnifiedLog,
};

/// Unified log lines attached to readiness failures.
pub const LOG_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
	Waiting,
	Ready,
	Dead,
	TimedOut,
}

/// Why [`wait_listening`] gave up.
#[derive(Debug, Clone)]
pub enum NotReady {
	TimedOut { elapsed: Duration },
	/// The watched process exited before the port accepted connections
	Dead(ProcessExit),
	Cancelled,
}

impl NotReady {
	/// Turns a failed wait into the run error for `check`, with the unified log tail attached.
	pub async fn into_error(self, check: &ReadinessCheck<'_>, log: &UnifiedLog) -> Error {
		match self {
			Self::Cancelled => Error::Interrupted,
			Self::TimedOut { .. } => Error::ReadinessTimeout {
				label: check.label.to_string(),
				port: check.port,
				timeout: check.timeout,
				log_tail: log.tail(LOG_TAIL_LINES).await,
			},
			Self::Dead(status) => Error::EarlyProcessExit {
				label: check.label.to_string(),
				port: check.port,
				status: status.to_string(),
				log_tail: log.tail(LOG_TAIL_LINES).await,
			},
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessCheck<'a> {
	pub label: &'a str,
	pub port: u16,
	pub timeout: Duration,
	pub poll_interval: Duration,
}

/// Polls a loopback connect on `check.port` until it succeeds.
///
/// With a `process` to watch, its exit is noticed right away instead of after the timeout.
/// Returns how long it took for the port to become reachable.
pub async fn wait_listening(
	check: ReadinessCheck<'_>,
	process: Option<&ExitWatch>,
	cancel: &CancellationToken,
) -> Result<Duration, NotReady> {
	let ReadinessCheck {
		label,
		port,
		timeout: limit,
		poll_interval,
	} = check;

	let started = Instant::now();
	let deadline = started + limit;
	let mut exit = process.cloned();
	let mut state = ReadinessState::Waiting;

	debug!(%label, port, ?limit, "waiting for port to accept connections");

	loop {
		state = match state {
			ReadinessState::Waiting => poll_once(port, poll_interval, exit.as_ref(), deadline).await,
			ReadinessState::Ready => {
				let elapsed = started.elapsed();
				debug!(%label, port, ?elapsed, "port is ready");
				return Ok(elapsed);
			}
			ReadinessState::Dead => {
				let status = exit
					.as_ref()
					.and_then(|exit| exit.borrow().clone())
					.unwrap_or_else(|| ProcessExit::Lost("exited".to_string()));
				debug!(%label, port, %status, "process died before listening");
				return Err(NotReady::Dead(status));
			}
			ReadinessState::TimedOut => {
				return Err(NotReady::TimedOut {
					elapsed: started.elapsed(),
				});
			}
		};

		if state != ReadinessState::Waiting {
			continue;
		}

		let nap = poll_interval.min(deadline.saturating_duration_since(Instant::now()));
		tokio::select! {
			() = sleep(nap) => {}
			() = cancel.cancelled() => return Err(NotReady::Cancelled),
			// Wakes up as soon as the watched process goes away
			Some(()) = exited(exit.as_mut()) => {}
		}
	}
}

async fn poll_once(
	port: u16,
	poll_interval: Duration,
	exit: Option<&ExitWatch>,
	deadline: Instant,
) -> ReadinessState {
	let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
	let attempt = poll_interval.max(Duration::from_millis(50));

	match timeout(attempt, TcpStream::connect(addr)).await {
		Ok(Ok(_stream)) => return ReadinessState::Ready,
		Ok(Err(e)) => trace!(port, "not accepting connections yet: {e}"),
		Err(_) => trace!(port, "connect attempt timed out"),
	}

	if exit.is_some_and(|exit| exit.borrow().is_some()) {
		ReadinessState::Dead
	} else if Instant::now() >= deadline {
		ReadinessState::TimedOut
	} else {
		ReadinessState::Waiting
	}
}

async fn exited(exit: Option<&mut ExitWatch>) -> Option<()> {
	match exit {
		Some(exit) => exit.wait_for(Option::is_some).await.ok().map(|_| ()),
		None => None,
	}
}
