//! Live mirror of the unified log over TCP.
//!
//! Observers connect to the run's log port and receive every line appended from then on.
//! Delivery is best-effort: an observer that can't keep up is told how many lines it missed.

use std::{
	net::{Ipv4Addr, SocketAddr},
	sync::Arc,
};

use tokio::{
	io::{AsyncWriteExt, BufWriter},
	net::{TcpListener, TcpStream},
	sync::broadcast::{self, error::RecvError},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::unified_log::UnifiedLog;

#[derive(Debug)]
pub struct LogStream {
	port: u16,
	cancel: CancellationToken,
	handle: Option<JoinHandle<()>>,
}

impl LogStream {
	/// Binds the log port on loopback and starts accepting observers.
	///
	/// Stops on its own when `parent` is cancelled.
	pub async fn start(
		port: u16,
		log: &UnifiedLog,
		parent: &CancellationToken,
	) -> std::io::Result<Self> {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
		let cancel = parent.child_token();

		let handle = tokio::spawn(accept_loop(listener, log.clone(), cancel.clone()));

		info!(port, "unified log stream listening");

		Ok(Self {
			port,
			cancel,
			handle: Some(handle),
		})
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub async fn stop(&mut self) {
		self.cancel.cancel();
		if let Some(handle) = self.handle.take() {
			if let Err(e) = handle.await {
				warn!(port = self.port, "log stream task failed: {e:#?}");
			}
			debug!(port = self.port, "unified log stream stopped");
		}
	}
}

async fn accept_loop(listener: TcpListener, log: UnifiedLog, cancel: CancellationToken) {
	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((socket, peer)) => {
					debug!(%peer, "log observer connected");
					tokio::spawn(serve_observer(socket, peer, log.subscribe(), cancel.clone()));
				}
				Err(e) => warn!("failed to accept log observer: {e:#?}"),
			},
		}
	}
}

async fn serve_observer(
	socket: TcpStream,
	peer: SocketAddr,
	mut lines: broadcast::Receiver<Arc<str>>,
	cancel: CancellationToken,
) {
	let mut socket = BufWriter::new(socket);

	loop {
		let line = tokio::select! {
			() = cancel.cancelled() => break,
			line = lines.recv() => line,
		};

		let res = match line {
			Ok(line) => write_line(&mut socket, &line).await,
			Err(RecvError::Lagged(missed)) => {
				write_line(&mut socket, &format!("[log-stream] {missed} lines dropped")).await
			}
			Err(RecvError::Closed) => break,
		};

		if res.is_err() {
			debug!(%peer, "log observer went away");
			return;
		}
	}

	socket.flush().await.ok();
}

async fn write_line(socket: &mut BufWriter<TcpStream>, line: &str) -> std::io::Result<()> {
	socket.write_all(line.as_bytes()).await?;
	socket.write_all(b"\n").await?;
	socket.flush().await
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tempfile::tempdir;
	use tokio::{
		io::{AsyncBufReadExt, BufReader},
		time::timeout,
	};

	use super::*;

	#[tokio::test]
	async fn observers_receive_new_lines() {
		let dir = tempdir().unwrap();
		let (log, _) = UnifiedLog::open(dir.path().join("unified.log")).await.unwrap();
		let cancel = CancellationToken::new();

		let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let port = probe.local_addr().unwrap().port();
		drop(probe);

		let mut stream = LogStream::start(port, &log, &cancel).await.unwrap();

		let observer = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
		let mut observer = BufReader::new(observer).lines();

		// The observer subscribes once its connection is accepted
		let mut received = None;
		for _ in 0..50 {
			log.append("ui", "hello observers");
			if let Ok(line) = timeout(Duration::from_millis(100), observer.next_line()).await {
				received = line.unwrap();
				break;
			}
		}

		assert_eq!(received.as_deref(), Some("[ui] hello observers"));

		stream.stop().await;
		// Stopping twice is fine
		stream.stop().await;
	}
}
