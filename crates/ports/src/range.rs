use std::{fmt, ops::RangeInclusive};

use serde::{Deserialize, Serialize};

use super::error::AllocationError;

/// Inclusive range of TCP ports, always within `1..=65535` and never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange", into = "RawPortRange")]
pub struct PortRange {
	min: u16,
	max: u16,
}

impl PortRange {
	pub fn new(min: u16, max: u16) -> Result<Self, AllocationError> {
		Self::checked(u32::from(min), u32::from(max))
	}

	/// Same as [`PortRange::new`] but accepts values that may not even fit a port, as they
	/// come out of environment variables or config files.
	pub fn checked(min: u32, max: u32) -> Result<Self, AllocationError> {
		if min == 0 || min > max || max > u32::from(u16::MAX) {
			return Err(AllocationError::InvalidRange { min, max });
		}

		#[allow(clippy::cast_possible_truncation)]
		Ok(Self {
			min: min as u16,
			max: max as u16,
		})
	}

	pub const fn min(&self) -> u16 {
		self.min
	}

	pub const fn max(&self) -> u16 {
		self.max
	}

	pub fn contains(&self, port: u16) -> bool {
		(self.min..=self.max).contains(&port)
	}

	/// Number of ports in the range.
	pub fn len(&self) -> u32 {
		u32::from(self.max) - u32::from(self.min) + 1
	}

	pub fn is_empty(&self) -> bool {
		false
	}

	pub fn as_inclusive(&self) -> RangeInclusive<u16> {
		self.min..=self.max
	}

	/// Every port of the range exactly once, starting at `start` and wrapping around to `min`.
	///
	/// A `start` outside of the range is clamped into it.
	pub fn wrapping_from(&self, start: u16) -> impl Iterator<Item = u16> {
		let start = start.clamp(self.min, self.max);
		(start..=self.max).chain(self.min..start)
	}
}

impl fmt::Display for PortRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.min, self.max)
	}
}

#[derive(Serialize, Deserialize)]
struct RawPortRange {
	min: u32,
	max: u32,
}

impl TryFrom<RawPortRange> for PortRange {
	type Error = AllocationError;

	fn try_from(RawPortRange { min, max }: RawPortRange) -> Result<Self, Self::Error> {
		Self::checked(min, max)
	}
}

impl From<PortRange> for RawPortRange {
	fn from(range: PortRange) -> Self {
		Self {
			min: u32::from(range.min),
			max: u32::from(range.max),
		}
	}
}
