//! Port addressing for N-party secure computation meshes.
//!
//! Everything is derived from a single global base:
//!
//! ```text
//! party_base[i]   = base + i * 1000
//! control_port[i] = party_base[i] + 10000
//! offset(lo, hi)  = lo * parties - lo * (lo + 1) / 2 + (hi - lo)
//! comm_port(i, j) = party_base[min(i, j)] + offset(min(i, j), max(i, j))
//! ```
//!
//! The external mesh runtime computes the exact same numbers on its side, so this mapping must
//! not change. `offset` is a triangular index: it maps each unordered pair to a distinct value
//! in `1..=parties * (parties - 1) / 2`.

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use super::{error::AllocationError, probe::PortProbe, range::PortRange};

pub const PARTY_PORT_STRIDE: u16 = 1000;
pub const CONTROL_PORT_OFFSET: u16 = 10_000;

pub const MIN_MESH_PARTIES: usize = 2;
/// Above this the pair offsets of one party reach the next party's base.
pub const MAX_MESH_PARTIES: usize = 45;

/// Triangular pair index, symmetric in `a` and `b`.
pub fn pair_offset(a: usize, b: usize, parties: usize) -> usize {
	let lo = a.min(b);
	let hi = a.max(b);

	lo * parties - lo * (lo + 1) / 2 + (hi - lo)
}

/// Distance between a mesh base and the highest port derived from it.
///
/// The last party's control port is always the highest one, as pair offsets stay below
/// [`PARTY_PORT_STRIDE`] for every supported party count.
pub fn mesh_reserve(parties: usize) -> u32 {
	let parties = parties.max(MIN_MESH_PARTIES) as u32;

	(parties - 1) * u32::from(PARTY_PORT_STRIDE) + u32::from(CONTROL_PORT_OFFSET)
}

/// Highest base that keeps every derived port inside the port space.
pub fn max_mesh_base(parties: usize) -> Option<u16> {
	u32::from(u16::MAX)
		.checked_sub(mesh_reserve(parties))
		.and_then(|base| u16::try_from(base).ok())
		.filter(|base| *base > 0)
}

/// The full, collision free port set of one mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeshPortSet {
	parties: usize,
	global_base: u16,
}

/// Ports one party of the mesh listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartyMeshPorts {
	pub party_id: usize,
	pub base_port: u16,
	pub control_port: u16,
	/// `(remote party, local endpoint port)` for every other party.
	pub peer_ports: Vec<(usize, u16)>,
}

impl MeshPortSet {
	/// Party counts below two are coerced to two.
	pub fn new(parties: usize, global_base: u16) -> Result<Self, AllocationError> {
		let parties = parties.max(MIN_MESH_PARTIES);
		if parties > MAX_MESH_PARTIES {
			return Err(AllocationError::TooManyParties {
				parties,
				max: MAX_MESH_PARTIES,
			});
		}

		let max_base = max_mesh_base(parties).unwrap_or(0);
		if global_base == 0 || global_base > max_base {
			return Err(AllocationError::InvalidRange {
				min: u32::from(global_base),
				max: u32::from(global_base) + mesh_reserve(parties),
			});
		}

		Ok(Self {
			parties,
			global_base,
		})
	}

	pub const fn parties(&self) -> usize {
		self.parties
	}

	pub const fn global_base(&self) -> u16 {
		self.global_base
	}

	/// # Panics
	///
	/// Panics if `party` isn't a member of the mesh.
	pub fn party_base(&self, party: usize) -> u16 {
		self.assert_member(party);
		// Bounded by `max_mesh_base` at construction
		self.global_base + party as u16 * PARTY_PORT_STRIDE
	}

	/// # Panics
	///
	/// Panics if `party` isn't a member of the mesh.
	pub fn control_port(&self, party: usize) -> u16 {
		self.party_base(party) + CONTROL_PORT_OFFSET
	}

	/// The port shared by parties `a` and `b`, anchored on the lower party's base.
	///
	/// # Panics
	///
	/// Panics if `a == b` or either isn't a member of the mesh.
	pub fn comm_port(&self, a: usize, b: usize) -> u16 {
		self.endpoint_port(a.min(b), a.max(b))
	}

	/// The port `local` listens on for traffic with `remote`, anchored on `local`'s own base.
	///
	/// For `local < remote` this is [`MeshPortSet::comm_port`].
	///
	/// # Panics
	///
	/// Panics if `local == remote` or either isn't a member of the mesh.
	pub fn endpoint_port(&self, local: usize, remote: usize) -> u16 {
		assert_ne!(local, remote, "a party has no channel with itself");
		self.assert_member(remote);

		self.party_base(local) + pair_offset(local, remote, self.parties) as u16
	}

	pub fn party(&self, party: usize) -> PartyMeshPorts {
		PartyMeshPorts {
			party_id: party,
			base_port: self.party_base(party),
			control_port: self.control_port(party),
			peer_ports: (0..self.parties)
				.filter(|remote| *remote != party)
				.map(|remote| (remote, self.endpoint_port(party, remote)))
				.collect(),
		}
	}

	/// Every port of the mesh: all control ports plus every endpoint port of every party.
	pub fn all_ports(&self) -> Vec<u16> {
		let mut ports = Vec::with_capacity(self.parties * self.parties);

		for party in 0..self.parties {
			ports.push(self.control_port(party));
			for remote in (0..self.parties).filter(|remote| *remote != party) {
				ports.push(self.endpoint_port(party, remote));
			}
		}

		ports
	}

	fn assert_member(&self, party: usize) {
		assert!(
			party < self.parties,
			"party {party} is not part of a {}-party mesh",
			self.parties
		);
	}
}

/// Finds a base from which the whole mesh for `parties` parties is free.
///
/// Party counts below two are coerced to two. Exhausting the range is final: no retry happens
/// here, callers may try again with another range.
pub fn pick_mesh_base(
	probe: &impl PortProbe,
	parties: usize,
	range: PortRange,
) -> Result<MeshPortSet, AllocationError> {
	let candidates = mesh_candidates(parties, range)?;
	let start = rand::thread_rng().gen_range(candidates.as_inclusive());

	pick_mesh_base_from(probe, parties, range, start)
}

/// Deterministic version of [`pick_mesh_base`].
pub fn pick_mesh_base_from(
	probe: &impl PortProbe,
	parties: usize,
	range: PortRange,
	start: u16,
) -> Result<MeshPortSet, AllocationError> {
	let parties = parties.max(MIN_MESH_PARTIES);
	let candidates = mesh_candidates(parties, range)?;

	for base in candidates.wrapping_from(start) {
		let mesh = MeshPortSet::new(parties, base)?;
		if mesh.all_ports().into_iter().all(|port| probe.is_free(port)) {
			debug!(parties, base, "picked mesh base");
			return Ok(mesh);
		}
	}

	Err(AllocationError::MeshExhausted {
		parties,
		range,
		max_base: candidates.max(),
	})
}

fn mesh_candidates(parties: usize, range: PortRange) -> Result<PortRange, AllocationError> {
	let parties = parties.max(MIN_MESH_PARTIES);
	if parties > MAX_MESH_PARTIES {
		return Err(AllocationError::TooManyParties {
			parties,
			max: MAX_MESH_PARTIES,
		});
	}

	let max_base = max_mesh_base(parties).unwrap_or(0);
	let exhausted = AllocationError::MeshExhausted {
		parties,
		range,
		max_base,
	};

	if range.min() > max_base {
		return Err(exhausted);
	}

	PortRange::new(range.min(), range.max().min(max_base)).map_err(|_| exhausted)
}
