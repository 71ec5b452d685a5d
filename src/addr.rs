//! VSOCK endpoint addresses.

use std::fmt;
use std::os::unix::io::RawFd;

use nix::sys::socket::{SockaddrStorage, VsockAddr};

use crate::error::Error;

/// Wildcard context id, used to listen on any CID.
pub const VMADDR_CID_ANY: u32 = libc::VMADDR_CID_ANY;
/// Context id reserved for the hypervisor.
pub const VMADDR_CID_HYPERVISOR: u32 = libc::VMADDR_CID_HYPERVISOR;
/// Context id for loopback communication on the local machine.
pub const VMADDR_CID_LOCAL: u32 = libc::VMADDR_CID_LOCAL;
/// Context id of the host, as seen from a guest.
pub const VMADDR_CID_HOST: u32 = libc::VMADDR_CID_HOST;
/// Wildcard port, used to bind to an ephemeral port.
pub const VMADDR_PORT_ANY: u32 = libc::VMADDR_PORT_ANY;

/// A vsock endpoint: a (context id, port) pair.
///
/// Constructed by the caller and passed by value; equality is structural.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Addr {
	cid: u32,
	port: u32,
}

impl Addr {
	/// Create an address from a context id and port.
	#[must_use]
	pub const fn new(cid: u32, port: u32) -> Self {
		Self { cid, port }
	}

	/// The context id of this endpoint.
	#[must_use]
	pub const fn cid(&self) -> u32 {
		self.cid
	}

	/// The port of this endpoint.
	#[must_use]
	pub const fn port(&self) -> u32 {
		self.port
	}

	/// Whether this address denotes "listen on any CID".
	#[must_use]
	pub const fn is_wildcard(&self) -> bool {
		self.cid == VMADDR_CID_ANY
	}

	/// The native sockaddr representation of this address.
	#[must_use]
	pub(crate) fn to_vsock(self) -> VsockAddr {
		VsockAddr::new(self.cid, self.port)
	}

	/// Extract a vsock address from generic sockaddr storage. Storage
	/// holding any other address family is an [`Error::InvalidAddress`].
	pub(crate) fn from_storage(storage: &SockaddrStorage) -> Result<Self, Error> {
		storage.as_vsock_addr().map(|vsa| Self::from(*vsa)).ok_or_else(|| {
			Error::InvalidAddress("sockaddr is not a vsock address".to_string())
		})
	}
}

impl From<VsockAddr> for Addr {
	fn from(vsa: VsockAddr) -> Self {
		Self { cid: vsa.cid(), port: vsa.port() }
	}
}

impl fmt::Display for Addr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.cid, self.port)
	}
}

mod ioctl {
	// _IO(7, 0xb9) from linux/vm_sockets.h; libc does not export it
	const IOCTL_VM_SOCKETS_GET_LOCAL_CID: libc::c_ulong = 0x07B9;

	nix::ioctl_read_bad!(
		vm_sockets_get_local_cid,
		IOCTL_VM_SOCKETS_GET_LOCAL_CID,
		u32
	);
}

/// Query the local context id of this machine through a caller-supplied
/// descriptor (any vsock socket, or an open `/dev/vsock`).
///
/// Purely informational; no transport state is touched.
pub fn local_context_id(fd: RawFd) -> Result<u32, Error> {
	let mut cid: u32 = 0;
	// ioctl only writes the CID through the provided pointer
	unsafe { ioctl::vm_sockets_get_local_cid(fd, &mut cid) }
		.map_err(|errno| Error::syscall("ioctl", errno))?;
	Ok(cid)
}

#[cfg(test)]
mod test {
	use std::net::{Ipv4Addr, SocketAddrV4};

	use super::*;

	#[test]
	fn round_trips_through_native_representation() {
		for (cid, port) in
			[(0, 0), (3, 5000), (VMADDR_CID_HOST, 1024), (u32::MAX, u32::MAX)]
		{
			let addr = Addr::new(cid, port);
			let vsa = addr.to_vsock();
			assert_eq!(Addr::from(vsa), addr);
			assert_eq!(vsa.cid(), cid);
			assert_eq!(vsa.port(), port);
		}
	}

	#[test]
	fn display_is_cid_colon_port() {
		assert_eq!(Addr::new(3, 5000).to_string(), "3:5000");
		assert_eq!(Addr::new(VMADDR_CID_ANY, 0).to_string(), "4294967295:0");
	}

	#[test]
	fn wildcard_is_cid_any_only() {
		assert!(Addr::new(VMADDR_CID_ANY, 5000).is_wildcard());
		assert!(!Addr::new(VMADDR_CID_HOST, 5000).is_wildcard());
		assert!(!Addr::new(VMADDR_CID_LOCAL, 0).is_wildcard());
	}

	#[test]
	fn rejects_foreign_address_families() {
		let inet = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80);
		let storage = SockaddrStorage::from(inet);
		let err = Addr::from_storage(&storage).unwrap_err();
		assert!(matches!(err, Error::InvalidAddress(_)));
	}

	#[test]
	fn local_context_id_surfaces_the_ioctl_errno() {
		let err = local_context_id(-1).unwrap_err();
		match err {
			Error::Syscall { op, errno } => {
				assert_eq!(op, "ioctl");
				assert_eq!(errno, nix::errno::Errno::EBADF);
			}
			other => panic!("unexpected error: {other}"),
		}
	}
}
