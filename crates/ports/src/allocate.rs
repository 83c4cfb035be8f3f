use rand::Rng;
use tracing::debug;

use super::{error::AllocationError, probe::PortProbe, range::PortRange};

/// Picks one free port of `range`, starting the scan at a random port and wrapping around.
pub fn pick_port(probe: &impl PortProbe, range: PortRange) -> Result<u16, AllocationError> {
	let start = rand::thread_rng().gen_range(range.as_inclusive());
	pick_port_from(probe, range, start)
}

/// Deterministic version of [`pick_port`]: scans `[start, max]` then `[min, start - 1]`.
pub fn pick_port_from(
	probe: &impl PortProbe,
	range: PortRange,
	start: u16,
) -> Result<u16, AllocationError> {
	let port = range
		.wrapping_from(start)
		.find(|&port| probe.is_free(port))
		.ok_or(AllocationError::RangeExhausted { range })?;

	debug!(%range, port, "picked free port");

	Ok(port)
}

/// Picks the base of `count` consecutive free ports, all of them inside `range`.
///
/// A `count` of zero is treated as one.
pub fn pick_block(
	probe: &impl PortProbe,
	range: PortRange,
	count: u16,
) -> Result<u16, AllocationError> {
	let Some(candidates) = block_candidates(range, count) else {
		return Err(AllocationError::BlockExhausted { range, count });
	};

	let start = rand::thread_rng().gen_range(candidates.as_inclusive());
	pick_block_from(probe, range, count, start)
}

/// Deterministic version of [`pick_block`].
///
/// On a partially free candidate the scan advances by one port, not by `count`, so a free
/// sub-range straddling two candidate windows is never skipped.
pub fn pick_block_from(
	probe: &impl PortProbe,
	range: PortRange,
	count: u16,
	start: u16,
) -> Result<u16, AllocationError> {
	let count = count.max(1);

	let Some(candidates) = block_candidates(range, count) else {
		return Err(AllocationError::BlockExhausted { range, count });
	};

	let base = candidates
		.wrapping_from(start)
		.find(|&base| (0..count).all(|offset| probe.is_free(base + offset)))
		.ok_or(AllocationError::BlockExhausted { range, count })?;

	debug!(%range, base, count, "picked free port block");

	Ok(base)
}

/// Bases whose whole block still fits in `range`.
fn block_candidates(range: PortRange, count: u16) -> Option<PortRange> {
	let count = count.max(1);
	let last_base = range.max().checked_sub(count - 1)?;

	PortRange::new(range.min(), last_base).ok()
}

#[cfg(test)]
mod tests {
	use std::{cell::RefCell, collections::HashSet};

	use super::*;

	fn busy(ports: &[u16]) -> impl Fn(u16) -> bool {
		let busy = ports.iter().copied().collect::<HashSet<_>>();
		move |port| !busy.contains(&port)
	}

	#[test]
	fn scans_forward_from_start() {
		let range = PortRange::new(100, 110).unwrap();

		assert_eq!(pick_port_from(&busy(&[105, 106]), range, 105), Ok(107));
	}

	#[test]
	fn wraps_around_to_range_start() {
		let range = PortRange::new(100, 110).unwrap();
		let probe = busy(&[108, 109, 110]);

		assert_eq!(pick_port_from(&probe, range, 108), Ok(100));
	}

	#[test]
	fn errors_when_every_port_is_busy() {
		let range = PortRange::new(100, 104).unwrap();
		let probed = RefCell::new(Vec::new());
		let probe = |port: u16| {
			probed.borrow_mut().push(port);
			false
		};

		assert_eq!(
			pick_port_from(&probe, range, 102),
			Err(AllocationError::RangeExhausted { range })
		);
		assert_eq!(*probed.borrow(), vec![102, 103, 104, 100, 101]);
	}

	#[test]
	fn random_pick_stays_in_range() {
		let range = PortRange::new(40_000, 40_010).unwrap();
		let probe = |_port: u16| true;

		for _ in 0..100 {
			assert!(range.contains(pick_port(&probe, range).unwrap()));
		}
	}

	#[test]
	fn block_advances_by_one_on_partial_failure() {
		let range = PortRange::new(100, 120).unwrap();
		// 100..=102 free, 103 busy, 104..=107 free
		let probe = busy(&[103, 108]);

		assert_eq!(pick_block_from(&probe, range, 4, 100), Ok(104));
		assert_eq!(pick_block_from(&probe, range, 3, 100), Ok(100));
		assert_eq!(pick_block_from(&probe, range, 3, 101), Ok(104));
	}

	#[test]
	fn block_never_extends_past_range_end() {
		let range = PortRange::new(100, 105).unwrap();
		let probe = |_port: u16| true;

		for start in 100..=105 {
			let base = pick_block_from(&probe, range, 4, start).unwrap();
			assert!(base + 3 <= 105, "base {base} overflows the range");
		}
	}

	#[test]
	fn block_larger_than_range_is_exhausted() {
		let range = PortRange::new(100, 102).unwrap();
		let probe = |_port: u16| true;

		assert_eq!(
			pick_block(&probe, range, 4),
			Err(AllocationError::BlockExhausted { range, count: 4 })
		);
	}

	#[test]
	fn block_probes_every_candidate_before_giving_up() {
		let range = PortRange::new(100, 109).unwrap();
		let bases = RefCell::new(HashSet::new());
		// Every odd port is busy, so no two consecutive ports are ever free
		let probe = |port: u16| {
			bases.borrow_mut().insert(port);
			port % 2 == 0
		};

		assert!(pick_block_from(&probe, range, 2, 105).is_err());
		// Every candidate base 100..=108 had at least its first port probed
		assert!((100..=108).all(|base| bases.borrow().contains(&base)));
	}
}
