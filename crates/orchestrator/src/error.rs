use std::{fmt, path::Path, time::Duration};

use bv_ports::AllocationError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Configuration(#[from] ConfigError),

	#[error("port allocation failed: {0}")]
	Allocation(#[from] AllocationError),

	#[error(
		"'{label}' did not listen on port {port} within {timeout:?}; \
		check the unified log below or raise READINESS_TIMEOUT_MS{}",
		LogTail(.log_tail)
	)]
	ReadinessTimeout {
		label: String,
		port: u16,
		timeout: Duration,
		log_tail: Vec<String>,
	},

	#[error(
		"'{label}' exited ({status}) before listening on port {port}; \
		waiting longer won't help, see the unified log below{}",
		LogTail(.log_tail)
	)]
	EarlyProcessExit {
		label: String,
		port: u16,
		status: String,
		log_tail: Vec<String>,
	},

	#[error("failed to spawn '{label}' (program '{program}'): {source}; is it installed and on PATH?")]
	Spawn {
		label: String,
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("run interrupted by signal")]
	Interrupted,

	#[error("test runner failed for target '{target}' ({status})")]
	RunnerFailed { target: String, status: String },

	#[error("test runner for target '{target}' still running after {timeout:?}; raise RUNNER_TIMEOUT_MS if it is just slow")]
	RunnerTimedOut { target: String, timeout: Duration },

	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl Error {
	pub const CONFIGURATION_EXIT_CODE: i32 = 2;
	pub const ALLOCATION_EXIT_CODE: i32 = 3;
	pub const READINESS_TIMEOUT_EXIT_CODE: i32 = 4;
	pub const EARLY_EXIT_EXIT_CODE: i32 = 5;
	pub const RUNNER_FAILED_EXIT_CODE: i32 = 6;
	pub const INTERRUPTED_EXIT_CODE: i32 = 130;

	/// Process exit code reported for this error.
	pub fn exit_code(&self) -> i32 {
		match self {
			Self::Configuration(_) => Self::CONFIGURATION_EXIT_CODE,
			Self::Allocation(_) => Self::ALLOCATION_EXIT_CODE,
			Self::ReadinessTimeout { .. } => Self::READINESS_TIMEOUT_EXIT_CODE,
			Self::EarlyProcessExit { .. } => Self::EARLY_EXIT_EXIT_CODE,
			Self::RunnerFailed { .. } | Self::RunnerTimedOut { .. } => Self::RUNNER_FAILED_EXIT_CODE,
			Self::Interrupted => Self::INTERRUPTED_EXIT_CODE,
			Self::Spawn { .. } | Self::FileIO(_) => 1,
		}
	}
}

struct LogTail<'a>(&'a [String]);

impl fmt::Display for LogTail<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.0.is_empty() {
			return Ok(());
		}

		writeln!(f, "\n--- unified log tail ---")?;
		for line in self.0 {
			writeln!(f, "{line}")?;
		}
		write!(f, "------------------------")
	}
}

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: std::io::Error,
	pub maybe_context: Option<&'static str>,
}

impl fmt::Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl<P: AsRef<Path>> From<(P, std::io::Error)> for FileIOError {
	fn from((path, source): (P, std::io::Error)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}
}

impl<P: AsRef<Path>> From<(P, std::io::Error, &'static str)> for FileIOError {
	fn from((path, source, context): (P, std::io::Error, &'static str)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context),
		}
	}
}
