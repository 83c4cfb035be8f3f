use thiserror::Error;

use super::range::PortRange;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
	#[error(
		"invalid port range <min='{min}', max='{max}'>; \
		ports must satisfy 1 <= min <= max <= 65535"
	)]
	InvalidRange { min: u32, max: u32 },

	#[error(
		"no free port in range {range}; \
		widen the range or stop whatever is listening on it"
	)]
	RangeExhausted { range: PortRange },

	#[error(
		"no {count} consecutive free ports in range {range}; \
		widen the range or lower the block size"
	)]
	BlockExhausted { range: PortRange, count: u16 },

	#[error(
		"no free mesh base for {parties} parties in range {range} (highest usable base is {max_base}); \
		set MESH_PORT_MIN/MESH_PORT_MAX to a wider or less crowded range"
	)]
	MeshExhausted {
		parties: usize,
		range: PortRange,
		max_base: u16,
	},

	#[error("a mesh of {parties} parties cannot be addressed collision free; at most {max} parties are supported")]
	TooManyParties { parties: usize, max: usize },
}
