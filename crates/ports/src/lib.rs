//!
//! # Ports
//!
//! Port provisioning for scenario runs that start many short lived services on one host.
//!
//! Nothing here locks a port. A port handed out by an allocator was free when it was probed and
//! is only *probabilistically* reserved afterwards: concurrent runs on the same host avoid each
//! other because every search starts at a random point of its range, not because of any mutual
//! exclusion. Callers that lose a race should re-pick and retry.
//!
//! - [`pick_port`] finds one free port in a range;
//! - [`pick_block`] finds `count` consecutive free ports;
//! - [`pick_mesh_base`] finds a base port from which a whole N-party communication mesh
//!   ([`MeshPortSet`]) can be derived without collisions;
//!
//! All allocators take a [`PortProbe`], so they can be driven by real loopback sockets
//! ([`LoopbackProbe`]) or by a ledger aware wrapper ([`Excluding`]) that also treats ports
//! already handed out to the current run as busy.
//!
//! ## Basic example
//!
//! ```no_run
//! use bv_ports::{pick_mesh_base, pick_port, LoopbackProbe, PortRange};
//!
//! let ui = pick_port(&LoopbackProbe, PortRange::new(8082, 8999).unwrap()).unwrap();
//! let mesh = pick_mesh_base(&LoopbackProbe, 3, PortRange::new(20000, 40000).unwrap()).unwrap();
//!
//! assert!((8082..=8999).contains(&ui));
//! assert_eq!(mesh.comm_port(0, 1), mesh.comm_port(1, 0));
//! ```

mod allocate;
mod error;
mod mesh;
mod probe;
mod range;

pub use allocate::{pick_block, pick_block_from, pick_port, pick_port_from};
pub use error::AllocationError;
pub use mesh::{
	max_mesh_base, mesh_reserve, pair_offset, pick_mesh_base, pick_mesh_base_from, MeshPortSet,
	PartyMeshPorts, CONTROL_PORT_OFFSET, MAX_MESH_PARTIES, MIN_MESH_PARTIES, PARTY_PORT_STRIDE,
};
pub use probe::{is_free, Excluding, LoopbackProbe, PortProbe};
pub use range::PortRange;
