use futures::{stream::FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{launcher::ExitWatch, unified_log::UnifiedLog};

/// Reports supervised instances that exit while they are supposed to be serving.
#[derive(Debug)]
pub struct Watchdog {
	cancel: CancellationToken,
	handle: Option<JoinHandle<Vec<String>>>,
}

impl Watchdog {
	pub fn spawn(watched: Vec<(String, ExitWatch)>, log: &UnifiedLog, parent: &CancellationToken) -> Self {
		let cancel = parent.child_token();
		let handle = tokio::spawn(watch_exits(watched, log.clone(), cancel.clone()));

		Self {
			cancel,
			handle: Some(handle),
		}
	}

	/// Stops watching and returns the labels of instances that died meanwhile.
	pub async fn stop(&mut self) -> Vec<String> {
		self.cancel.cancel();

		match self.handle.take() {
			Some(handle) => handle.await.unwrap_or_else(|e| {
				warn!("watchdog task failed: {e:#?}");
				Vec::new()
			}),
			None => Vec::new(),
		}
	}
}

async fn watch_exits(
	watched: Vec<(String, ExitWatch)>,
	log: UnifiedLog,
	cancel: CancellationToken,
) -> Vec<String> {
	debug!(count = watched.len(), "watchdog started");

	let mut exits = watched
		.into_iter()
		.map(|(label, mut exit)| async move {
			let status = exit
				.wait_for(Option::is_some)
				.await
				.ok()
				.and_then(|exit| exit.clone());
			(label, status)
		})
		.collect::<FuturesUnordered<_>>();

	let mut died = Vec::new();

	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			next = exits.next() => match next {
				Some((label, status)) => {
					let status = status.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".to_string());
					warn!(%label, %status, "instance exited while the scenario was running");
					log.append("watchdog", &format!("{label} exited unexpectedly ({status})"));
					died.push(label);
				}
				None => break,
			},
		}
	}

	died
}
