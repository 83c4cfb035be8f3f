#![allow(dead_code)]

use std::{
	net::{Ipv4Addr, TcpListener},
	path::Path,
	sync::Arc,
	time::Duration,
};

use bv_orchestrator::{
	CommandSpec, OrchestratorConfig, RunContext, RunFlags, Scenario, UnifiedLog,
};
use bv_ports::PortRange;
use tokio_util::sync::CancellationToken;

/// A port nobody listens on right now.
pub fn unused_port() -> u16 {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	listener.local_addr().unwrap().port()
}

pub fn sh(script: &str) -> CommandSpec {
	CommandSpec::new("sh", &["-c", script])
}

/// Short timeouts and harmless commands, nothing here needs the real app.
pub fn test_config(run_root: &Path) -> OrchestratorConfig {
	OrchestratorConfig {
		ui_ports: PortRange::new(42000, 42999).unwrap(),
		ws_ports: PortRange::new(43000, 43999).unwrap(),
		log_ports: PortRange::new(44000, 44999).unwrap(),
		daemon_ports: PortRange::new(45000, 45999).unwrap(),
		readiness_timeout: Duration::from_secs(5),
		logger_timeout: Duration::from_secs(2),
		daemon_timeout: Duration::from_secs(5),
		runner_timeout: Duration::from_secs(10),
		poll_interval: Duration::from_millis(25),
		stop_grace: Duration::from_millis(500),
		ui_command: sh("sleep 30"),
		gui_command: sh("sleep 30"),
		runner_command: sh("exit 0"),
		project_dir: run_root.to_path_buf(),
		run_root: run_root.to_path_buf(),
		..OrchestratorConfig::default()
	}
}

pub async fn run_context(
	config: OrchestratorConfig,
	scenario: Scenario,
	flags: RunFlags,
) -> RunContext {
	let run_dir = bv_orchestrator::prepare_run_dir(&config, scenario).unwrap();
	let (log, _) = UnifiedLog::open(run_dir.join("logs/unified.log")).await.unwrap();

	RunContext::new(
		Arc::new(config),
		scenario,
		flags,
		run_dir,
		log,
		CancellationToken::new(),
	)
}

/// Polls the unified log until a line contains `needle`.
pub async fn wait_for_line(log: &UnifiedLog, needle: &str) -> bool {
	for _ in 0..100 {
		if log.tail(200).await.iter().any(|line| line.contains(needle)) {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	false
}
