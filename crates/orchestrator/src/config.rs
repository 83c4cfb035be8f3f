//! Orchestrator configuration.
//!
//! Built once at startup from, in increasing precedence: the defaults below, an optional TOML
//! file, environment variables, and finally command line flags applied by the binary.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	time::Duration,
};

use bv_ports::{max_mesh_base, AllocationError, PortRange, MIN_MESH_PARTIES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("unknown scenario '{name}'; available scenarios: {known}")]
	UnknownScenario { name: String, known: String },

	#[error("invalid value '{value}' for {var}: {reason}")]
	InvalidEnv {
		var: &'static str,
		value: String,
		reason: String,
	},

	#[error("invalid port range for {field}: {source}")]
	InvalidRange {
		field: &'static str,
		#[source]
		source: AllocationError,
	},

	#[error("failed to read config file '{}': {source}", .path.display())]
	ReadFile {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file '{}': {source}", .path.display())]
	ParseFile {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("{0}")]
	Invalid(String),
}

/// A program plus its arguments.
///
/// Arguments may contain `{name}` placeholders which are filled in right before spawning, see
/// [`CommandSpec::render`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
	pub program: String,
	#[serde(default)]
	pub args: Vec<String>,
}

impl CommandSpec {
	pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
		Self {
			program: program.into(),
			args: args.iter().map(ToString::to_string).collect(),
		}
	}

	/// Arguments with every `{key}` replaced by its value.
	pub fn render(&self, vars: &HashMap<&str, String>) -> Vec<String> {
		render_args(&self.args, vars)
	}
}

pub(crate) fn render_args(args: &[String], vars: &HashMap<&str, String>) -> Vec<String> {
	args.iter().map(|arg| render_arg(arg, vars)).collect()
}

/// Single left to right pass, substituted values are never scanned again. Unknown placeholders
/// are kept as they are.
fn render_arg(arg: &str, vars: &HashMap<&str, String>) -> String {
	let mut rendered = String::with_capacity(arg.len());
	let mut rest = arg;

	while let Some(open) = rest.find('{') {
		rendered.push_str(&rest[..open]);
		rest = &rest[open..];

		let value = rest
			.find('}')
			.and_then(|close| vars.get(&rest[1..close]).map(|value| (close, value)));

		match value {
			Some((close, value)) => {
				rendered.push_str(value);
				rest = &rest[close + 1..];
			}
			None => {
				rendered.push('{');
				rest = &rest[1..];
			}
		}
	}

	rendered.push_str(rest);
	rendered
}

/// The external synchronization daemon and its documented subcommands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonCommands {
	pub program: String,
	pub start_args: Vec<String>,
	pub stop_args: Vec<String>,
}

impl Default for DaemonCommands {
	fn default() -> Self {
		Self {
			program: "syftbox-devstack".to_string(),
			start_args: ["start", "--port", "{port}", "--clients", "{clients}", "--sandbox", "{sandbox}"]
				.map(String::from)
				.to_vec(),
			stop_args: ["stop", "--sandbox", "{sandbox}"].map(String::from).to_vec(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
	/// UI server port range, `UI_PORT_MIN`/`UI_PORT_MAX`
	pub ui_ports: PortRange,
	/// Per-party WebSocket bridge ports, `WS_PORT_MIN`/`WS_PORT_MAX`
	pub ws_ports: PortRange,
	/// Unified log stream port, `LOG_PORT_MIN`/`LOG_PORT_MAX`
	pub log_ports: PortRange,
	/// Sync daemon server port, `SYNC_PORT_MIN`/`SYNC_PORT_MAX`
	pub daemon_ports: PortRange,
	/// Search range for the mesh base, `MESH_PORT_MIN`/`MESH_PORT_MAX`
	pub mesh_ports: PortRange,
	/// Skips the mesh search and uses this base, `MESH_PORT_BASE`
	pub mesh_base: Option<u16>,

	#[serde(with = "duration_ms")]
	pub readiness_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub logger_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub daemon_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub runner_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub poll_interval: Duration,
	#[serde(with = "duration_ms")]
	pub stop_grace: Duration,
	/// Launch attempts for a port-bound service whose port got taken in between
	pub launch_attempts: u32,

	pub ui_command: CommandSpec,
	pub gui_command: CommandSpec,
	pub daemon: DaemonCommands,
	pub runner_command: CommandSpec,
	pub interactive_runner_args: Vec<String>,

	/// Where the UI, GUI and runner commands are run from, `BV_PROJECT_DIR`
	pub project_dir: PathBuf,
	pub run_root: PathBuf,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		#[allow(clippy::unwrap_used)] // constant ranges
		let range = |min, max| PortRange::new(min, max).unwrap();

		Self {
			ui_ports: range(8082, 8999),
			ws_ports: range(3333, 3999),
			log_ports: range(9750, 9850),
			daemon_ports: range(8100, 8199),
			mesh_ports: range(20000, 40000),
			mesh_base: None,

			readiness_timeout: Duration::from_secs(60),
			logger_timeout: Duration::from_secs(5),
			daemon_timeout: Duration::from_secs(60),
			runner_timeout: Duration::from_secs(30 * 60),
			poll_interval: Duration::from_millis(200),
			stop_grace: Duration::from_secs(3),
			launch_attempts: 3,

			ui_command: CommandSpec::new(
				"npm",
				&["run", "dev", "--", "--port", "{port}", "--strictPort"],
			),
			gui_command: CommandSpec::new("./src-tauri/target/debug/bv-desktop", &[]),
			daemon: DaemonCommands::default(),
			runner_command: CommandSpec::new("npx", &["playwright", "test", "{target}"]),
			interactive_runner_args: vec!["--headed".to_string()],

			project_dir: PathBuf::from("."),
			run_root: PathBuf::from("test-runs"),
		}
	}
}

impl OrchestratorConfig {
	/// Defaults, then `file` if any, then the process environment.
	pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match file {
			Some(path) => Self::from_file(path)?,
			None => Self::default(),
		};

		config.apply_env(|var| std::env::var(var).ok())?;

		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
			path: path.to_path_buf(),
			source,
		})?;

		toml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Overlays environment variables, looked up through `lookup` so tests don't have to touch
	/// the real process environment.
	pub fn apply_env(
		&mut self,
		lookup: impl Fn(&str) -> Option<String>,
	) -> Result<(), ConfigError> {
		let env = EnvReader { lookup: &lookup };

		self.ui_ports = env.range("UI_PORT_MIN", "UI_PORT_MAX", self.ui_ports)?;
		self.ws_ports = env.range("WS_PORT_MIN", "WS_PORT_MAX", self.ws_ports)?;
		self.log_ports = env.range("LOG_PORT_MIN", "LOG_PORT_MAX", self.log_ports)?;
		self.daemon_ports = env.range("SYNC_PORT_MIN", "SYNC_PORT_MAX", self.daemon_ports)?;
		self.mesh_ports = env.range("MESH_PORT_MIN", "MESH_PORT_MAX", self.mesh_ports)?;

		if let Some(base) = env.parse::<u16>("MESH_PORT_BASE")? {
			self.mesh_base = Some(base);
		}

		for (var, slot) in [
			("READINESS_TIMEOUT_MS", &mut self.readiness_timeout),
			("LOGGER_TIMEOUT_MS", &mut self.logger_timeout),
			("SYNC_DAEMON_TIMEOUT_MS", &mut self.daemon_timeout),
			("RUNNER_TIMEOUT_MS", &mut self.runner_timeout),
			("READINESS_POLL_MS", &mut self.poll_interval),
			("STOP_GRACE_MS", &mut self.stop_grace),
		] {
			if let Some(ms) = env.parse::<u64>(var)? {
				*slot = Duration::from_millis(ms);
			}
		}

		if let Some(attempts) = env.parse::<u32>("LAUNCH_ATTEMPTS")? {
			self.launch_attempts = attempts;
		}

		if let Some(dir) = lookup("BV_PROJECT_DIR") {
			self.project_dir = PathBuf::from(dir);
		}

		if let Some(root) = lookup("BV_TEST_RUN_ROOT") {
			self.run_root = PathBuf::from(root);
		}

		self.validate()
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		// The exact bound depends on the scenario, see `check_mesh_base`
		self.check_mesh_base(MIN_MESH_PARTIES)?;

		if self.poll_interval.is_zero() {
			return Err(ConfigError::Invalid(
				"the readiness poll interval must be at least 1ms".to_string(),
			));
		}

		if self.launch_attempts == 0 {
			return Err(ConfigError::Invalid(
				"LAUNCH_ATTEMPTS must be at least 1".to_string(),
			));
		}

		Ok(())
	}

	/// Fails when the configured mesh base leaves no room for a mesh of `parties` parties.
	pub fn check_mesh_base(&self, parties: usize) -> Result<(), ConfigError> {
		let Some(base) = self.mesh_base else {
			return Ok(());
		};

		let reason = match max_mesh_base(parties) {
			Some(max) if base != 0 && base <= max => return Ok(()),
			Some(max) => format!(
				"a {parties} party mesh needs a base between 1 and {max}; \
				lower it or unset it to search MESH_PORT_MIN..MESH_PORT_MAX"
			),
			None => format!("a {parties} party mesh doesn't fit in the port space"),
		};

		Err(ConfigError::InvalidEnv {
			var: "MESH_PORT_BASE",
			value: base.to_string(),
			reason,
		})
	}
}

struct EnvReader<'a, F> {
	lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
	fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
	where
		T: std::str::FromStr,
		T::Err: std::fmt::Display,
	{
		(self.lookup)(var)
			.map(|value| {
				value
					.trim()
					.parse::<T>()
					.map_err(|e| ConfigError::InvalidEnv {
						var,
						value: value.clone(),
						reason: e.to_string(),
					})
			})
			.transpose()
	}

	fn range(
		&self,
		min_var: &'static str,
		max_var: &'static str,
		current: PortRange,
	) -> Result<PortRange, ConfigError> {
		let min = self.parse::<u32>(min_var)?;
		let max = self.parse::<u32>(max_var)?;

		if min.is_none() && max.is_none() {
			return Ok(current);
		}

		PortRange::checked(
			min.unwrap_or(u32::from(current.min())),
			max.unwrap_or(u32::from(current.max())),
		)
		.map_err(|source| ConfigError::InvalidRange {
			field: min_var,
			source,
		})
	}
}

mod duration_ms {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect::<HashMap<_, _>>();
		move |var| vars.get(var).cloned()
	}

	#[test]
	fn env_overrides_defaults() {
		let mut config = OrchestratorConfig::default();
		config
			.apply_env(env(&[
				("UI_PORT_MIN", "9000"),
				("UI_PORT_MAX", "9100"),
				("WS_PORT_MAX", "3400"),
				("READINESS_TIMEOUT_MS", "1500"),
				("MESH_PORT_BASE", "25000"),
			]))
			.unwrap();

		assert_eq!(config.ui_ports, PortRange::new(9000, 9100).unwrap());
		assert_eq!(config.ws_ports, PortRange::new(3333, 3400).unwrap());
		assert_eq!(config.readiness_timeout, Duration::from_millis(1500));
		assert_eq!(config.mesh_base, Some(25000));
	}

	#[test]
	fn inverted_range_is_a_configuration_error() {
		let mut config = OrchestratorConfig::default();
		let e = config
			.apply_env(env(&[("UI_PORT_MIN", "9000"), ("UI_PORT_MAX", "8000")]))
			.unwrap_err();

		assert!(matches!(e, ConfigError::InvalidRange { field: "UI_PORT_MIN", .. }));
	}

	#[test]
	fn garbage_numbers_name_the_variable() {
		let mut config = OrchestratorConfig::default();
		let e = config
			.apply_env(env(&[("LOGGER_TIMEOUT_MS", "soon")]))
			.unwrap_err();

		assert!(e.to_string().contains("LOGGER_TIMEOUT_MS"));
	}

	#[test]
	fn toml_file_fills_missing_fields_with_defaults() {
		let config: OrchestratorConfig = toml::from_str(
			r#"
			readiness_timeout = 250
			ui_ports = { min = 10000, max = 10010 }

			[runner_command]
			program = "sh"
			args = ["-c", "exit 0"]
			"#,
		)
		.unwrap();

		assert_eq!(config.readiness_timeout, Duration::from_millis(250));
		assert_eq!(config.ui_ports, PortRange::new(10000, 10010).unwrap());
		assert_eq!(config.runner_command, CommandSpec::new("sh", &["-c", "exit 0"]));
		assert_eq!(config.ws_ports, OrchestratorConfig::default().ws_ports);
	}

	#[test]
	fn placeholders_are_rendered() {
		let spec = CommandSpec::new("npm", &["--port", "{port}", "x{port}y", "{unknown}", "{{port}}"]);
		let vars = HashMap::from([("port", "8082".to_string())]);

		assert_eq!(
			spec.render(&vars),
			vec!["--port", "8082", "x8082y", "{unknown}", "{8082}"]
		);
	}

	#[test]
	fn substituted_values_are_not_rendered_again() {
		let spec = CommandSpec::new("app", &["{home}:{port}", "{port}-{home}"]);
		let vars = HashMap::from([
			("port", "8082".to_string()),
			("home", "/runs/{port}/client1".to_string()),
		]);

		// Same result whatever order the map iterates in
		for _ in 0..20 {
			assert_eq!(
				spec.render(&vars),
				vec!["/runs/{port}/client1:8082", "8082-/runs/{port}/client1"]
			);
		}
	}

	#[test]
	fn mesh_base_beyond_the_port_space_is_a_configuration_error() {
		let mut config = OrchestratorConfig::default();
		let e = config
			.apply_env(env(&[("MESH_PORT_BASE", "60000")]))
			.unwrap_err();

		assert!(
			matches!(e, ConfigError::InvalidEnv { var: "MESH_PORT_BASE", ref value, .. } if value == "60000"),
			"{e}"
		);
		assert!(e.to_string().contains("between 1 and 54535"), "{e}");
	}

	#[test]
	fn zero_mesh_base_is_rejected_from_env_and_file() {
		let e = OrchestratorConfig::default()
			.apply_env(env(&[("MESH_PORT_BASE", "0")]))
			.unwrap_err();
		assert!(matches!(e, ConfigError::InvalidEnv { var: "MESH_PORT_BASE", .. }), "{e}");

		let config: OrchestratorConfig = toml::from_str("mesh_base = 0").unwrap();
		let e = config.validate().unwrap_err();
		assert!(matches!(e, ConfigError::InvalidEnv { var: "MESH_PORT_BASE", .. }), "{e}");

		let mut config: OrchestratorConfig = toml::from_str("mesh_base = 60000").unwrap();
		assert!(config.apply_env(env(&[])).is_err());
	}

	#[test]
	fn mesh_base_bound_depends_on_the_party_count() {
		let config = OrchestratorConfig {
			mesh_base: Some(54000),
			..OrchestratorConfig::default()
		};

		config.validate().unwrap();
		config.check_mesh_base(2).unwrap();
		assert!(config.check_mesh_base(3).is_err());

		let config = OrchestratorConfig {
			mesh_base: Some(53535),
			..config
		};
		config.check_mesh_base(3).unwrap();
	}
}
