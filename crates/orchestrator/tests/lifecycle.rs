#![cfg(unix)]

use bv_orchestrator::{
	launcher::{launch, LaunchSpec, ProcessExit},
	readiness::{wait_listening, NotReady, ReadinessCheck},
	RunFlags, Scenario, StepOutcome, UnifiedLog,
};

use std::{
	io::{BufRead, BufReader},
	net::Ipv4Addr,
	process::Stdio,
	time::{Duration, Instant},
};

use bv_ports::is_free;

use tempfile::tempdir;
use tokio::{net::TcpListener, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

mod common;

use common::{run_context, test_config, unused_port, wait_for_line};

fn sh(label: &str, script: &str, workdir: &std::path::Path) -> LaunchSpec {
	LaunchSpec::new(label, "sh", workdir).args(["-c", script])
}

#[tokio::test]
#[traced_test]
async fn output_is_tagged_in_the_unified_log() {
	let dir = tempdir().unwrap();
	let (log, _) = UnifiedLog::open(dir.path().join("unified.log")).await.unwrap();

	let mut instance = launch(
		sh("talker", "echo hello; echo oops >&2", dir.path()),
		&log,
	)
	.await
	.unwrap();

	assert!(instance.wait().await.success());
	assert!(wait_for_line(&log, "[talker] hello").await);
	assert!(wait_for_line(&log, "[talker:err] oops").await);
}

#[tokio::test]
#[traced_test]
async fn environment_and_workdir_reach_the_process() {
	let dir = tempdir().unwrap();
	let (log, _) = UnifiedLog::open(dir.path().join("unified.log")).await.unwrap();
	let home = dir.path().join("client1@sandbox.local");

	let mut instance = launch(
		sh("env", "echo \"$BV_PARTY_EMAIL in $(pwd)\"", &home).env("BV_PARTY_EMAIL", "client1@sandbox.local"),
		&log,
	)
	.await
	.unwrap();

	instance.wait().await;

	assert!(home.is_dir());
	assert!(wait_for_line(&log, "client1@sandbox.local in").await);
}

#[tokio::test]
#[traced_test]
async fn readiness_succeeds_once_the_port_listens() {
	let port = unused_port();

	let listener = tokio::spawn(async move {
		sleep(Duration::from_millis(300)).await;
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
		sleep(Duration::from_secs(5)).await;
		drop(listener);
	});

	let check = ReadinessCheck {
		label: "late listener",
		port,
		timeout: Duration::from_secs(5),
		poll_interval: Duration::from_millis(50),
	};

	let elapsed = wait_listening(check, None, &CancellationToken::new())
		.await
		.unwrap();

	assert!(elapsed >= Duration::from_millis(250));
	assert!(elapsed < Duration::from_secs(5));

	listener.abort();
}

#[tokio::test]
#[traced_test]
async fn early_exit_is_reported_without_waiting_for_the_timeout() {
	let dir = tempdir().unwrap();
	let (log, _) = UnifiedLog::open(dir.path().join("unified.log")).await.unwrap();
	let port = unused_port();

	let instance = launch(sh("crasher", "sleep 0.3; exit 3", dir.path()).port(port), &log)
		.await
		.unwrap();

	let check = ReadinessCheck {
		label: "crasher",
		port,
		timeout: Duration::from_secs(30),
		poll_interval: Duration::from_millis(50),
	};

	let started = Instant::now();
	let res = wait_listening(check, Some(&instance.exit_watch()), &CancellationToken::new()).await;
	let elapsed = started.elapsed();

	let Err(NotReady::Dead(ProcessExit::Exited(status))) = res else {
		panic!("expected an early exit, got {res:?}");
	};
	assert_eq!(status.code(), Some(3));
	assert!(elapsed >= Duration::from_millis(250));
	assert!(elapsed < Duration::from_secs(3));

	let e = NotReady::Dead(ProcessExit::Exited(status))
		.into_error(&check, &log)
		.await;
	assert_eq!(e.exit_code(), 5);
}

#[tokio::test]
#[traced_test]
async fn stubborn_processes_get_killed_after_the_grace_period() {
	let dir = tempdir().unwrap();
	let (log, _) = UnifiedLog::open(dir.path().join("unified.log")).await.unwrap();

	let mut instance = launch(sh("stubborn", "trap '' TERM; sleep 30", dir.path()), &log)
		.await
		.unwrap();
	// Let the shell install its trap
	sleep(Duration::from_millis(200)).await;

	let started = Instant::now();
	let exit = instance.stop(Duration::from_millis(300)).await;

	assert!(!exit.success());
	assert!(started.elapsed() >= Duration::from_millis(300));
	assert!(started.elapsed() < Duration::from_secs(5));
	assert!(!instance.is_running());

	// Already stopped
	assert!(!instance.stop(Duration::from_millis(300)).await.success());
}

#[tokio::test]
#[traced_test]
async fn cleanup_is_idempotent() {
	let dir = tempdir().unwrap();
	let mut ctx = run_context(test_config(dir.path()), Scenario::Onboarding, RunFlags::default()).await;

	let mut exits = Vec::new();
	for label in ["first", "second"] {
		let instance = launch(sh(label, "sleep 30", &ctx.run_dir), &ctx.log)
			.await
			.unwrap();
		exits.push(instance.exit_watch());
		ctx.track(instance);
	}
	ctx.ledger.reserve(unused_port(), "first");
	ctx.timers.push("scenario");
	ctx.timers.push("launch");

	let first = ctx.cleanup().await;

	assert!(first.performed);
	assert!(first
		.steps
		.iter()
		.any(|step| step.name == "stop instances" && step.outcome == StepOutcome::Done));
	assert!(exits.iter().all(|exit| exit.borrow().is_some()));
	assert!(ctx.instances().is_empty());
	assert!(ctx.ledger.is_empty());
	assert_eq!(ctx.timers.depth(), 0);
	let timings = ctx.timers.summary().len();
	assert_eq!(timings, 3);

	let second = ctx.cleanup().await;

	assert!(!second.performed);
	assert!(second.steps.is_empty());
	assert_eq!(ctx.timers.summary().len(), timings);
}

#[tokio::test]
#[traced_test]
async fn preserve_flag_leaves_processes_running() {
	let dir = tempdir().unwrap();
	let flags = RunFlags {
		preserve: true,
		..RunFlags::default()
	};
	let mut ctx = run_context(test_config(dir.path()), Scenario::Onboarding, flags).await;

	let instance = launch(sh("kept", "sleep 30", &ctx.run_dir), &ctx.log)
		.await
		.unwrap();
	let pid = instance.pid;
	ctx.track(instance);

	let report = ctx.cleanup().await;

	assert!(report.performed);
	assert!(ctx.instances()[0].is_running());

	// Don't leak it past the test
	std::process::Command::new("kill")
		.args(["-9", "--", &format!("-{pid}")])
		.status()
		.unwrap();
}

#[tokio::test]
#[traced_test]
async fn cleanup_releases_listeners_left_on_reserved_ports() {
	if which::which("lsof").is_err() || which::which("python3").is_err() {
		eprintln!("lsof or python3 not available, skipping");
		return;
	}

	let dir = tempdir().unwrap();
	let mut ctx = run_context(test_config(dir.path()), Scenario::Onboarding, RunFlags::default()).await;
	let port = unused_port();
	ctx.ledger.reserve(port, "ui");

	// Not launched by us, so no instance stop reaches it
	let mut stray = std::process::Command::new("python3")
		.args([
			"-c",
			"import os, socket, sys, time\n\
			os.setsid()\n\
			s = socket.socket()\n\
			s.bind(('127.0.0.1', int(sys.argv[1])))\n\
			s.listen()\n\
			print('listening', flush=True)\n\
			time.sleep(30)",
			&port.to_string(),
		])
		.stdout(Stdio::piped())
		.spawn()
		.unwrap();

	let mut line = String::new();
	BufReader::new(stray.stdout.take().unwrap())
		.read_line(&mut line)
		.unwrap();
	assert_eq!(line.trim(), "listening");
	assert!(!is_free(port));

	let report = ctx.cleanup().await;

	assert!(
		report.steps.iter().any(|step| {
			step.name == "release lingering listeners" && step.outcome == StepOutcome::Done
		}),
		"{:?}",
		report.steps
	);
	assert!(is_free(port));
	assert!(!stray.wait().unwrap().success());
}
