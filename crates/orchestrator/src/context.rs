//! Per-run state, created once per scenario execution and passed to every phase.

use std::{
	collections::{BTreeMap, HashSet},
	path::{Path, PathBuf},
	sync::Arc,
};

use bv_ports::{
	pick_mesh_base, pick_port, AllocationError, Excluding, MeshPortSet, PartyMeshPorts, PortProbe,
	PortRange,
};
use chrono::Local;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	config::OrchestratorConfig,
	daemon::SyncDaemon,
	error::FileIOError,
	launcher::LaunchedInstance,
	log_stream::LogStream,
	scenario::Scenario,
	timer::TimerStack,
	unified_log::UnifiedLog,
	watchdog::Watchdog,
};

/// Every port handed out during one run, with who it was handed out to.
///
/// Allocations made through the ledger treat already reserved ports as busy, so ports of one run
/// never collide with each other even before the services owning them start listening.
#[derive(Debug, Default)]
pub struct PortLedger {
	reserved: HashSet<u16>,
	owners: BTreeMap<u16, String>,
}

impl PortLedger {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn pick_port(
		&mut self,
		probe: &impl PortProbe,
		owner: impl Into<String>,
		range: PortRange,
	) -> Result<u16, AllocationError> {
		let port = pick_port(&Excluding::new(probe, &self.reserved), range)?;
		self.reserve(port, owner);

		Ok(port)
	}

	/// Reserves a whole mesh, either at the configured `fixed_base` or at a searched one.
	pub fn pick_mesh(
		&mut self,
		probe: &impl PortProbe,
		parties: usize,
		range: PortRange,
		fixed_base: Option<u16>,
	) -> Result<MeshPortSet, AllocationError> {
		let mesh = match fixed_base {
			Some(base) => {
				let mesh = MeshPortSet::new(parties, base)?;
				let busy = mesh
					.all_ports()
					.into_iter()
					.filter(|port| self.reserved.contains(port) || !probe.is_free(*port))
					.collect::<Vec<_>>();
				if !busy.is_empty() {
					warn!(base, ?busy, "using the configured mesh base although some of its ports are busy");
				}
				mesh
			}
			None => pick_mesh_base(&Excluding::new(probe, &self.reserved), parties, range)?,
		};

		for party in 0..mesh.parties() {
			let owner = format!("mesh party {party}");
			self.reserve(mesh.control_port(party), owner.clone());
			for (_, port) in mesh.party(party).peer_ports {
				self.reserve(port, owner.clone());
			}
		}

		Ok(mesh)
	}

	/// Gives `port` back and picks a replacement for the same owner.
	pub fn repick(
		&mut self,
		probe: &impl PortProbe,
		port: u16,
		range: PortRange,
	) -> Result<u16, AllocationError> {
		let owner = self
			.owners
			.get(&port)
			.cloned()
			.unwrap_or_else(|| "unknown".to_string());

		// Keep the raced port excluded while picking, it is busy anyway
		let new_port = pick_port(&Excluding::new(probe, &self.reserved), range)?;
		self.release(port);
		self.reserve(new_port, owner);

		Ok(new_port)
	}

	pub fn reserve(&mut self, port: u16, owner: impl Into<String>) {
		let owner = owner.into();
		debug!(port, %owner, "reserved port");
		self.reserved.insert(port);
		self.owners.insert(port, owner);
	}

	pub fn release(&mut self, port: u16) {
		self.reserved.remove(&port);
		self.owners.remove(&port);
	}

	pub fn contains(&self, port: u16) -> bool {
		self.reserved.contains(&port)
	}

	pub fn owner(&self, port: u16) -> Option<&str> {
		self.owners.get(&port).map(String::as_str)
	}

	/// Reserved ports, ascending.
	pub fn ports(&self) -> Vec<u16> {
		self.owners.keys().copied().collect()
	}

	pub fn len(&self) -> usize {
		self.reserved.len()
	}

	pub fn is_empty(&self) -> bool {
		self.reserved.is_empty()
	}

	pub fn clear(&mut self) {
		self.reserved.clear();
		self.owners.clear();
	}
}

/// One participant of the scenario.
#[derive(Debug, Clone, Serialize)]
pub struct Party {
	pub index: usize,
	pub role: &'static str,
	/// Identity, e.g. `client1@sandbox.local`
	pub label: String,
	pub home_dir: PathBuf,
	pub ws_port: u16,
	pub mesh: Option<PartyMeshPorts>,
}

impl Party {
	/// Environment of the party's GUI process.
	pub fn env(&self, daemon_url: Option<&str>, mesh: Option<&MeshPortSet>) -> Vec<(String, String)> {
		let home = self.home_dir.display().to_string();
		let mut env = vec![
			("BIOVAULT_HOME".to_string(), home.clone()),
			("BV_PARTY_ID".to_string(), self.index.to_string()),
			("BV_PARTY_EMAIL".to_string(), self.label.clone()),
			("DEV_WS_BRIDGE".to_string(), "1".to_string()),
			("DEV_WS_BRIDGE_PORT".to_string(), self.ws_port.to_string()),
			("SYFTBOX_DATA_DIR".to_string(), home),
			("BIOVAULT_DEV_MODE".to_string(), "1".to_string()),
			("DISABLE_UPDATER".to_string(), "1".to_string()),
		];

		if let Some(url) = daemon_url {
			env.push(("SYFTBOX_SERVER_URL".to_string(), url.to_string()));
		}

		if let (Some(ports), Some(mesh)) = (&self.mesh, mesh) {
			let peers = ports
				.peer_ports
				.iter()
				.map(|(peer, port)| format!("{peer}:{port}"))
				.collect::<Vec<_>>()
				.join(",");

			env.extend([
				("SEQURE_COMMUNICATION_PORT".to_string(), mesh.global_base().to_string()),
				("BV_MESH_BASE".to_string(), mesh.global_base().to_string()),
				("BV_MESH_PARTIES".to_string(), mesh.parties().to_string()),
				("BV_MESH_PARTY_ID".to_string(), ports.party_id.to_string()),
				("BV_MESH_CONTROL_PORT".to_string(), ports.control_port.to_string()),
				("BV_MESH_PEER_PORTS".to_string(), peers),
				("SEQURE_TCP_PROXY".to_string(), "1".to_string()),
			]);
		}

		env
	}
}

/// Every port a run reserved, written to `ports.json` before anything is launched.
#[derive(Debug, Clone, Serialize)]
pub struct PortPlan {
	pub ui_port: u16,
	pub log_port: u16,
	pub daemon_port: Option<u16>,
	pub mesh: Option<MeshPortSet>,
	pub parties: Vec<Party>,
}

impl PortPlan {
	pub fn write_json(&self, path: &Path) -> Result<(), FileIOError> {
		let json = serde_json::to_vec_pretty(self)
			.map_err(|e| FileIOError::from((path, std::io::Error::other(e))))?;

		std::fs::write(path, json).map_err(|e| FileIOError::from((path, e, "failed to write port plan")))
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
	/// Runner in headed mode, `INTERACTIVE_MODE=1`
	pub interactive: bool,
	/// Leave every process running after the run, `--no-cleanup`
	pub preserve: bool,
	/// Pause before cleanup until Enter is pressed
	pub wait: bool,
}

#[derive(Debug)]
pub struct RunContext {
	pub config: Arc<OrchestratorConfig>,
	pub scenario: Scenario,
	pub flags: RunFlags,
	pub run_dir: PathBuf,
	pub log: UnifiedLog,
	pub cancel: CancellationToken,
	pub ledger: PortLedger,
	pub plan: Option<PortPlan>,
	pub timers: TimerStack,
	pub(crate) instances: Vec<LaunchedInstance>,
	pub(crate) log_stream: Option<LogStream>,
	pub(crate) daemon: Option<SyncDaemon>,
	pub(crate) watchdog: Option<Watchdog>,
	pub(crate) cleaned_up: bool,
}

impl RunContext {
	pub fn new(
		config: Arc<OrchestratorConfig>,
		scenario: Scenario,
		flags: RunFlags,
		run_dir: PathBuf,
		log: UnifiedLog,
		cancel: CancellationToken,
	) -> Self {
		Self {
			config,
			scenario,
			flags,
			run_dir,
			log,
			cancel,
			ledger: PortLedger::new(),
			plan: None,
			timers: TimerStack::new(),
			instances: Vec::new(),
			log_stream: None,
			daemon: None,
			watchdog: None,
			cleaned_up: false,
		}
	}

	pub fn instances(&self) -> &[LaunchedInstance] {
		&self.instances
	}

	pub fn is_cleaned_up(&self) -> bool {
		self.cleaned_up
	}

	/// Keeps `instance` supervised until cleanup.
	pub fn track(&mut self, instance: LaunchedInstance) {
		self.instances.push(instance);
	}

	pub fn sandbox_dir(&self) -> PathBuf {
		self.run_dir.join("sandbox")
	}
}

impl Drop for RunContext {
	fn drop(&mut self) {
		if self.cleaned_up || self.flags.preserve {
			return;
		}

		let alive = self.instances.iter().filter(|i| i.is_running()).count();
		if alive > 0 {
			warn!(alive, "run dropped without cleanup, killing its processes");
		}
		for instance in &mut self.instances {
			instance.force_kill();
		}
	}
}

/// Creates a fresh `<run_root>/<scenario>-<timestamp>-<pid>` directory for one run.
pub fn prepare_run_dir(config: &OrchestratorConfig, scenario: Scenario) -> Result<PathBuf, FileIOError> {
	let run_dir = config.run_root.join(format!(
		"{scenario}-{}-{}",
		Local::now().format("%Y%m%d-%H%M%S"),
		std::process::id()
	));

	std::fs::create_dir_all(run_dir.join("logs"))
		.map_err(|e| FileIOError::from((&run_dir, e, "failed to create run directory")))?;

	Ok(run_dir)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn busy(ports: &'static [u16]) -> impl Fn(u16) -> bool {
		move |port| !ports.contains(&port)
	}

	#[test]
	fn ledger_never_hands_out_a_port_twice() {
		let mut ledger = PortLedger::new();
		let range = PortRange::new(4000, 4002).unwrap();
		let probe = busy(&[]);

		let mut picked = (0..3)
			.map(|i| ledger.pick_port(&probe, format!("svc{i}"), range).unwrap())
			.collect::<Vec<_>>();
		picked.sort_unstable();

		assert_eq!(picked, vec![4000, 4001, 4002]);
		assert!(matches!(
			ledger.pick_port(&probe, "one too many", range),
			Err(AllocationError::RangeExhausted { .. })
		));
	}

	#[test]
	fn repick_keeps_the_owner_and_drops_the_old_port() {
		let mut ledger = PortLedger::new();
		let range = PortRange::new(4000, 4001).unwrap();
		let probe = busy(&[]);

		let first = ledger.pick_port(&probe, "ui", range).unwrap();
		let second = ledger.repick(&probe, first, range).unwrap();

		assert_ne!(first, second);
		assert!(!ledger.contains(first));
		assert_eq!(ledger.owner(second), Some("ui"));
	}

	#[test]
	fn mesh_ports_are_reserved_in_the_ledger() {
		let mut ledger = PortLedger::new();
		let mesh = ledger
			.pick_mesh(&busy(&[]), 3, PortRange::new(20000, 20000).unwrap(), None)
			.unwrap();

		assert_eq!(ledger.len(), mesh.all_ports().len());
		assert!(ledger.contains(30000));
		assert!(ledger.contains(21003));
		assert_eq!(ledger.owner(32000), Some("mesh party 2"));
	}

	#[test]
	fn fixed_mesh_base_is_used_as_is() {
		let mut ledger = PortLedger::new();
		let mesh = ledger
			.pick_mesh(&busy(&[20001]), 2, PortRange::new(1, 2).unwrap(), Some(20000))
			.unwrap();

		assert_eq!(mesh.global_base(), 20000);
		assert_eq!(mesh.comm_port(0, 1), 20001);
	}

	#[test]
	fn mesh_env_lists_every_peer() {
		let mesh = MeshPortSet::new(3, 20000).unwrap();
		let party = Party {
			index: 1,
			role: "client1",
			label: "client1@sandbox.local".to_string(),
			home_dir: PathBuf::from("/tmp/client1"),
			ws_port: 3400,
			mesh: Some(mesh.party(1)),
		};

		let env = party
			.env(Some("http://127.0.0.1:8100"), Some(&mesh))
			.into_iter()
			.collect::<BTreeMap<_, _>>();

		assert_eq!(env["DEV_WS_BRIDGE_PORT"], "3400");
		assert_eq!(env["SEQURE_COMMUNICATION_PORT"], "20000");
		assert_eq!(env["BV_MESH_CONTROL_PORT"], "31000");
		assert_eq!(
			env["BV_MESH_PEER_PORTS"],
			format!("0:{},2:{}", mesh.endpoint_port(1, 0), mesh.endpoint_port(1, 2))
		);
		assert_eq!(env["SYFTBOX_SERVER_URL"], "http://127.0.0.1:8100");
	}
}
