use std::{
	collections::HashSet,
	io::ErrorKind,
	net::{Ipv4Addr, SocketAddrV4, TcpListener},
};

use tracing::trace;

/// Answers whether a port can be handed out right now.
pub trait PortProbe {
	fn is_free(&self, port: u16) -> bool;
}

/// Probes ports by binding a listener on the IPv4 loopback interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
	fn is_free(&self, port: u16) -> bool {
		is_free(port)
	}
}

/// Attempts a loopback bind and releases it immediately.
///
/// The listener is dropped before returning, so this can be called in tight loops without
/// leaking descriptors. Any bind failure (not only `AddrInUse`) counts as busy since the port
/// couldn't be used by a launched service either.
pub fn is_free(port: u16) -> bool {
	if port == 0 {
		return false;
	}

	match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
		Ok(listener) => {
			drop(listener);
			true
		}
		Err(e) if e.kind() == ErrorKind::AddrInUse => false,
		Err(e) => {
			trace!(port, "port probe failed: {e}");
			false
		}
	}
}

/// Wraps another probe and reports every port of `reserved` as busy.
///
/// Used with the run's port ledger so ports already assigned to this run, but whose services
/// aren't listening yet, are never handed out twice.
pub struct Excluding<'a, P> {
	inner: &'a P,
	reserved: &'a HashSet<u16>,
}

impl<'a, P: PortProbe> Excluding<'a, P> {
	pub fn new(inner: &'a P, reserved: &'a HashSet<u16>) -> Self {
		Self { inner, reserved }
	}
}

impl<P: PortProbe> PortProbe for Excluding<'_, P> {
	fn is_free(&self, port: u16) -> bool {
		!self.reserved.contains(&port) && self.inner.is_free(port)
	}
}

impl<F: Fn(u16) -> bool> PortProbe for F {
	fn is_free(&self, port: u16) -> bool {
		self(port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bound_port_is_busy_and_released_port_is_free() {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let port = listener.local_addr().unwrap().port();

		assert!(!is_free(port));

		drop(listener);

		assert!(is_free(port));
	}

	#[test]
	fn port_zero_is_never_free() {
		assert!(!is_free(0));
	}

	#[test]
	fn repeated_probing_does_not_hold_the_port() {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);

		for _ in 0..500 {
			assert!(is_free(port));
		}

		// Still bindable by someone else after all those probes
		let _listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
	}

	#[test]
	fn excluding_masks_reserved_ports() {
		let reserved = HashSet::from([5000]);
		let all_free = |_port: u16| true;
		let probe = Excluding::new(&all_free, &reserved);

		assert!(!probe.is_free(5000));
		assert!(probe.is_free(5001));
	}
}
