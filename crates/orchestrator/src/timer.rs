use std::{path::Path, time::Duration};

use owo_colors::OwoColorize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FileIOError;

#[derive(Debug)]
struct TimerFrame {
	label: String,
	started: Instant,
}

/// One finished phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
	pub label: String,
	/// Nesting level when the phase was pushed, 0 being the outermost
	pub depth: usize,
	#[serde(rename = "duration_ms", serialize_with = "as_millis")]
	pub duration: Duration,
	/// Closed by [`TimerStack::unwind`] instead of a matching pop
	pub forced: bool,
}

/// LIFO stack of named, nestable timed phases.
///
/// Completed phases accumulate in pop order, so inner phases show up before the phase that
/// contains them.
#[derive(Debug, Default)]
pub struct TimerStack {
	open: Vec<TimerFrame>,
	completed: Vec<PhaseTiming>,
}

impl TimerStack {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, label: impl Into<String>) {
		let label = label.into();
		debug!(depth = self.open.len(), "▶ {label}");
		self.open.push(TimerFrame {
			label,
			started: Instant::now(),
		});
	}

	/// Closes the most recently pushed phase that is still open.
	pub fn pop(&mut self) -> Option<(String, Duration)> {
		self.close(false)
	}

	/// Force-closes every open phase, innermost first. Returns how many were still open.
	pub fn unwind(&mut self) -> usize {
		let open = self.open.len();
		if open > 0 {
			warn!(open, "closing unfinished timed phases");
		}
		while self.close(true).is_some() {}

		open
	}

	pub fn depth(&self) -> usize {
		self.open.len()
	}

	pub fn summary(&self) -> &[PhaseTiming] {
		&self.completed
	}

	pub fn print_summary(&self) {
		if self.completed.is_empty() {
			return;
		}

		println!();
		println!("{}", "Timing Summary".bright_cyan().bold());

		for timing in &self.completed {
			print_row(timing);
		}
		println!();
	}

	pub fn write_json(&self, path: &Path) -> Result<(), FileIOError> {
		let json = serde_json::to_vec_pretty(&self.completed)
			.map_err(|e| FileIOError::from((path, std::io::Error::other(e))))?;

		std::fs::write(path, json)
			.map_err(|e| FileIOError::from((path, e, "failed to write timing summary")))
	}

	fn close(&mut self, forced: bool) -> Option<(String, Duration)> {
		let TimerFrame { label, started } = self.open.pop()?;
		let duration = started.elapsed();

		debug!(depth = self.open.len(), ?duration, forced, "■ {label}");

		self.completed.push(PhaseTiming {
			label: label.clone(),
			depth: self.open.len(),
			duration,
			forced,
		});

		Some((label, duration))
	}
}

fn print_row(timing: &PhaseTiming) {
	let indent = "  ".repeat(timing.depth);
	let secs = format!("{:.2}s", timing.duration.as_secs_f64());

	if timing.forced {
		println!(
			"  {indent}{} {} {}",
			secs.yellow(),
			timing.label,
			"(unfinished)".dimmed()
		);
	} else {
		println!("  {indent}{} {}", secs.bright_green(), timing.label);
	}
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
