use std::str::FromStr;

use serde::Serialize;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::config::ConfigError;

/// Named end-to-end topologies the orchestrator knows how to bring up.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Display,
	EnumString,
	EnumIter,
	IntoStaticStr,
	Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
	Onboarding,
	Profiles,
	Jupyter,
	Messaging,
	PipelinesCollab,
	FlowsMultiparty,
	SyqureMultiparty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
	/// One UI port plus one WebSocket bridge port per party
	Simple,
	/// Simple, plus a pairwise communication mesh between all parties
	Mesh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScenarioSpec {
	pub roles: &'static [&'static str],
	pub topology: Topology,
	pub needs_sync_daemon: bool,
	/// What the external test runner is pointed at
	pub runner_target: &'static str,
}

impl ScenarioSpec {
	pub fn party_count(&self) -> usize {
		self.roles.len()
	}
}

pub const PARTY_DOMAIN: &str = "sandbox.local";

impl Scenario {
	/// Resolves a scenario name, failing before anything is allocated or launched.
	pub fn select(name: &str) -> Result<Self, ConfigError> {
		Self::from_str(name.trim()).map_err(|_| ConfigError::UnknownScenario {
			name: name.to_string(),
			known: Self::iter()
				.map(|scenario| scenario.to_string())
				.collect::<Vec<_>>()
				.join(", "),
		})
	}

	pub fn spec(self) -> ScenarioSpec {
		use Topology::{Mesh, Simple};

		const SOLO: &[&str] = &["client1"];
		const PAIR: &[&str] = &["client1", "client2"];
		const TRIO: &[&str] = &["aggregator", "client1", "client2"];

		let (roles, topology, needs_sync_daemon, runner_target) = match self {
			Self::Onboarding => (SOLO, Simple, false, "tests/ui/onboarding.spec.ts"),
			Self::Profiles => (SOLO, Simple, false, "tests/ui/profiles.spec.ts"),
			Self::Jupyter => (SOLO, Simple, false, "tests/ui/jupyter.spec.ts"),
			Self::Messaging => (PAIR, Simple, true, "tests/ui/messaging.spec.ts"),
			Self::PipelinesCollab => (PAIR, Simple, true, "tests/ui/pipelines-collab.spec.ts"),
			Self::FlowsMultiparty => (TRIO, Simple, true, "tests/ui/flows-multiparty.spec.ts"),
			Self::SyqureMultiparty => (TRIO, Mesh, true, "tests/ui/syqure-multiparty.spec.ts"),
		};

		ScenarioSpec {
			roles,
			topology,
			needs_sync_daemon,
			runner_target,
		}
	}

	/// The whole catalogue, in declaration order.
	pub fn all() -> impl Iterator<Item = Self> {
		Self::iter()
	}

	/// Identity of the party playing `role`, e.g. `client1@sandbox.local`.
	pub fn party_label(role: &str) -> String {
		format!("{role}@{PARTY_DOMAIN}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn names_round_trip() {
		for scenario in Scenario::iter() {
			assert_eq!(Scenario::select(&scenario.to_string()).unwrap(), scenario);
		}
		assert_eq!(
			Scenario::select("syqure-multiparty").unwrap(),
			Scenario::SyqureMultiparty
		);
	}

	#[test]
	fn unknown_scenario_lists_the_catalogue() {
		let e = Scenario::select("does-not-exist").unwrap_err();
		let message = e.to_string();

		assert!(message.contains("does-not-exist"));
		assert!(message.contains("messaging"));
		assert!(message.contains("syqure-multiparty"));
	}

	#[test]
	fn only_the_mesh_scenario_uses_a_mesh() {
		for scenario in Scenario::iter() {
			let spec = scenario.spec();
			assert_eq!(
				spec.topology == Topology::Mesh,
				scenario == Scenario::SyqureMultiparty
			);
			if spec.topology == Topology::Mesh {
				assert!(spec.party_count() >= 2);
			}
		}
	}
}
