//! Passive sockets accepting inbound vsock connections.

use nix::sys::socket::AddressFamily;

use crate::addr::Addr;
use crate::conn::Connection;
use crate::error::Error;
use crate::fd::NetFd;
use crate::NETWORK;

/// Backlog applied when the caller does not size the queue.
pub const DEFAULT_BACKLOG: usize = 128;

/// A vsock socket in listening state.
#[derive(Debug)]
pub struct Listener {
	fd: NetFd,
	addr: Addr,
}

/// Bind and listen on `addr` with the default backlog.
///
/// `network` must be `"vsock"`; anything else fails with
/// [`Error::UnsupportedNetwork`] before a single syscall is issued.
pub fn listen(network: &str, addr: Addr) -> Result<Listener, Error> {
	listen_with_backlog(network, addr, DEFAULT_BACKLOG)
}

/// [`listen`] with a caller-sized backlog.
pub fn listen_with_backlog(
	network: &str,
	addr: Addr,
	backlog: usize,
) -> Result<Listener, Error> {
	if network != NETWORK {
		return Err(Error::UnsupportedNetwork(network.to_string()));
	}
	// any failure past socket creation drops the handle, which releases the
	// descriptor
	let fd = NetFd::open(AddressFamily::Vsock)?;
	fd.set_default_listener_sockopts()?;
	fd.bind(&addr.to_vsock())?;
	fd.listen(backlog)?;
	Ok(Listener { fd, addr })
}

impl Listener {
	/// Accept one inbound connection, suspending until a peer connects or
	/// the listener is closed.
	///
	/// The accepted connection owns a brand-new descriptor; its addresses
	/// are derived from the OS at accept time.
	pub async fn accept(&self) -> Result<Connection, Error> {
		let fd = self.fd.accept().await?;
		let laddr = Addr::from_storage(&fd.local_name()?)?;
		let raddr = Addr::from_storage(
			&fd.peer_name()
				.map_err(|errno| Error::syscall("getpeername", errno))?,
		)?;
		Ok(Connection::new(fd, laddr, raddr))
	}

	/// Close the listener, unblocking any pending accept with
	/// [`Error::Closed`]. A second close fails with [`Error::Closed`].
	pub fn close(&self) -> Result<(), Error> {
		self.fd.close()
	}

	/// The address this listener was asked to bind, as supplied by the
	/// caller. Wildcard fields are not re-resolved against the OS.
	#[must_use]
	pub fn local_addr(&self) -> Addr {
		self.addr
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn rejects_foreign_network_identifiers() {
		for network in ["tcp", "unix", "vsock4", ""] {
			let err = listen(network, Addr::new(3, 5000)).unwrap_err();
			assert!(matches!(err, Error::UnsupportedNetwork(_)));
		}
	}
}
