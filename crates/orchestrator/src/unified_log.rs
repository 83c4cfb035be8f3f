//! The single append-only log of a run.
//!
//! Launched processes' stdout/stderr and the orchestrator's own diagnostics all end up in one
//! file, written by a single task so lines never interleave mid-way. Every line is also
//! mirrored on a broadcast channel for live observers (see [`crate::log_stream`]).

use std::{
	io::{self, SeekFrom},
	path::{Path, PathBuf},
	sync::Arc,
};

use tokio::{
	fs::OpenOptions,
	io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter},
	sync::{broadcast, mpsc, oneshot},
	task::JoinHandle,
};
use tracing::error;

use crate::error::FileIOError;

const MIRROR_CAPACITY: usize = 1024;
const TAIL_CHUNK: u64 = 8 * 1024;

enum LogCommand {
	Line(Arc<str>),
	Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct UnifiedLog {
	path: Arc<Path>,
	tx: mpsc::UnboundedSender<LogCommand>,
	mirror: broadcast::Sender<Arc<str>>,
}

impl std::fmt::Debug for LogCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Line(line) => f.debug_tuple("Line").field(line).finish(),
			Self::Flush(_) => f.write_str("Flush"),
		}
	}
}

impl UnifiedLog {
	/// Opens (or creates) the log file in append mode and starts its writer task.
	///
	/// The writer task ends once every handle to the log, and every sink, has been dropped.
	pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, JoinHandle<()>), FileIOError> {
		let path = path.into();

		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent, e, "failed to create log directory")))?;
		}

		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await
			.map_err(|e| FileIOError::from((&path, e, "failed to open unified log")))?;

		let (tx, rx) = mpsc::unbounded_channel();
		let (mirror, _) = broadcast::channel(MIRROR_CAPACITY);

		let handle = tokio::spawn(write_loop(BufWriter::new(file), rx, path.clone()));

		Ok((
			Self {
				path: path.into(),
				tx,
				mirror,
			},
			handle,
		))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Appends `line` tagged with its `source`, e.g. `[client1@sandbox.local] listening`.
	pub fn append(&self, source: &str, line: &str) {
		self.push(format!("[{source}] {}", line.trim_end()).into());
	}

	/// Appends a line as is.
	pub fn append_raw(&self, line: &str) {
		self.push(line.trim_end().into());
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
		self.mirror.subscribe()
	}

	/// Blocking writer feeding the log, meant to back a `tracing` layer.
	pub fn sink(&self) -> UnifiedLogSink {
		UnifiedLogSink {
			log: self.clone(),
			pending: Vec::new(),
		}
	}

	/// Resolves once everything appended so far reached the file.
	pub async fn flush(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		if self.tx.send(LogCommand::Flush(done_tx)).is_ok() {
			done_rx.await.ok();
		}
	}

	/// Last `lines` lines of the log file, read backwards from its end.
	pub async fn tail(&self, lines: usize) -> Vec<String> {
		self.flush().await;

		match read_tail(&self.path, lines).await {
			Ok(tail) => tail,
			Err(e) => {
				error!(path = %self.path.display(), "failed to read unified log tail: {e}");
				Vec::new()
			}
		}
	}

	fn push(&self, line: Arc<str>) {
		// No subscribers is the common case
		let _ = self.mirror.send(Arc::clone(&line));
		// The writer only goes away at shutdown, late lines are dropped then
		let _ = self.tx.send(LogCommand::Line(line));
	}
}

async fn write_loop(
	mut file: BufWriter<tokio::fs::File>,
	mut rx: mpsc::UnboundedReceiver<LogCommand>,
	path: PathBuf,
) {
	while let Some(command) = rx.recv().await {
		let res = match command {
			LogCommand::Line(line) => write_line(&mut file, &line).await,
			LogCommand::Flush(done) => {
				let res = file.flush().await;
				done.send(()).ok();
				res
			}
		};

		if let Err(e) = res {
			// Can't log this into the file we failed to write to
			eprintln!("unified log write failed ({}): {e}", path.display());
		}

		if rx.is_empty() {
			if let Err(e) = file.flush().await {
				eprintln!("unified log flush failed ({}): {e}", path.display());
			}
		}
	}

	file.flush().await.ok();
}

/// Reads `path` backwards, chunk by chunk, until more than `lines` line breaks were seen.
async fn read_tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
	if lines == 0 {
		return Ok(Vec::new());
	}

	let mut file = tokio::fs::File::open(path).await?;
	let mut start = file.metadata().await?.len();
	let mut buf = Vec::new();

	// One break more than needed, the bytes before it may be a partial line
	while start > 0 && buf.iter().filter(|b| **b == b'\n').count() <= lines {
		let chunk = TAIL_CHUNK.min(start);
		start -= chunk;

		let mut bytes = vec![0u8; chunk as usize];
		file.seek(SeekFrom::Start(start)).await?;
		file.read_exact(&mut bytes).await?;
		bytes.extend_from_slice(&buf);
		buf = bytes;
	}

	let text = String::from_utf8_lossy(&buf);
	let mut all = text.lines().collect::<Vec<_>>();
	if start > 0 && !all.is_empty() {
		all.remove(0);
	}

	Ok(all[all.len().saturating_sub(lines)..]
		.iter()
		.map(ToString::to_string)
		.collect())
}

async fn write_line(file: &mut BufWriter<tokio::fs::File>, line: &str) -> io::Result<()> {
	file.write_all(line.as_bytes()).await?;
	file.write_all(b"\n").await
}

/// [`io::Write`] adapter splitting written bytes into lines of the unified log.
#[derive(Debug)]
pub struct UnifiedLogSink {
	log: UnifiedLog,
	pending: Vec<u8>,
}

impl io::Write for UnifiedLogSink {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.pending.extend_from_slice(buf);

		while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
			let line = self.pending.drain(..=newline).collect::<Vec<_>>();
			self.log.append_raw(&String::from_utf8_lossy(&line));
		}

		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		if !self.pending.is_empty() {
			let line = std::mem::take(&mut self.pending);
			self.log.append_raw(&String::from_utf8_lossy(&line));
		}

		Ok(())
	}
}
