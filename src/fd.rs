//! Owned socket descriptors wired into the tokio reactor.
//!
//! NOTE TO MAINTAINERS: Interaction with any sys calls should be contained
//! within this module and `addr`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::socket::{
	accept4, bind, connect, getpeername, getsockname, getsockopt, listen,
	recv, send, setsockopt, shutdown, socket, sockopt, AddressFamily,
	MsgFlags, Shutdown, SockFlag, SockType, SockaddrLike, SockaddrStorage,
};
use nix::unistd::close;
use tokio::io::unix::AsyncFd;

use crate::error::Error;

/// Raw descriptor that is released exactly once, when dropped.
#[derive(Debug)]
pub(crate) struct OwnedSock(RawFd);

impl AsRawFd for OwnedSock {
	fn as_raw_fd(&self) -> RawFd {
		self.0
	}
}

impl Drop for OwnedSock {
	fn drop(&mut self) {
		// do not crash in Drop
		close(self.0).unwrap_or_else(|e| {
			eprintln!("failed to close socket fd {}: {e}", self.0);
		});
	}
}

/// An exclusively-owned stream socket.
///
/// The descriptor is created non-blocking with close-on-exec applied
/// atomically and registered with the tokio reactor; every operation that
/// would block suspends on readiness instead of blocking the OS thread.
///
/// `close` only marks the handle and wakes parked waiters; the descriptor
/// itself is released when the handle drops.
#[derive(Debug)]
pub(crate) struct NetFd {
	io: AsyncFd<OwnedSock>,
	family: AddressFamily,
	closed: AtomicBool,
}

impl NetFd {
	/// Allocate a new stream socket for `family`.
	pub(crate) fn open(family: AddressFamily) -> Result<Self, Error> {
		let fd = socket(
			family,
			SockType::Stream,
			SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
			None,
		)
		.map_err(|errno| Error::syscall("socket", errno))?;
		Self::from_raw(fd, family)
	}

	/// Adopt an already-created non-blocking descriptor, e.g. one returned
	/// by `accept4`.
	pub(crate) fn from_raw(
		fd: RawFd,
		family: AddressFamily,
	) -> Result<Self, Error> {
		let owned = OwnedSock(fd);
		let io = AsyncFd::new(owned)?;
		Ok(Self { io, family, closed: AtomicBool::new(false) })
	}

	pub(crate) fn raw(&self) -> RawFd {
		self.io.get_ref().as_raw_fd()
	}

	pub(crate) fn io(&self) -> &AsyncFd<OwnedSock> {
		&self.io
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	pub(crate) fn ensure_open(&self) -> Result<(), Error> {
		if self.is_closed() {
			return Err(Error::Closed);
		}
		Ok(())
	}

	/// Mark the handle closed and wake every task parked on its readiness.
	///
	/// Safe to call concurrently with in-flight operations; they observe the
	/// flag on wakeup and fail with [`Error::Closed`]. A second close fails
	/// with [`Error::Closed`] as well.
	pub(crate) fn close(&self) -> Result<(), Error> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(Error::Closed);
		}
		// Wakes parked accept/read/write/connect waiters. ENOTCONN from an
		// unconnected or listening socket is expected.
		let _ = shutdown(self.raw(), Shutdown::Both);
		Ok(())
	}

	/// Bind to a local address.
	pub(crate) fn bind(&self, addr: &dyn SockaddrLike) -> Result<(), Error> {
		self.ensure_open()?;
		bind(self.raw(), addr).map_err(|errno| Error::syscall("bind", errno))
	}

	/// Default options every listening socket gets before `bind`.
	pub(crate) fn set_default_listener_sockopts(&self) -> Result<(), Error> {
		setsockopt(self.raw(), sockopt::ReuseAddr, &true)
			.map_err(|errno| Error::syscall("setsockopt", errno))
	}

	/// Mark the socket passive with the given backlog.
	pub(crate) fn listen(&self, backlog: usize) -> Result<(), Error> {
		self.ensure_open()?;
		listen(self.raw(), backlog)
			.map_err(|errno| Error::syscall("listen", errno))
	}

	/// Issue the connect syscall once, surfacing the raw errno to the
	/// caller's state machine.
	pub(crate) fn start_connect(
		&self,
		addr: &dyn SockaddrLike,
	) -> nix::Result<()> {
		connect(self.raw(), addr)
	}

	/// Pending socket error (`SO_ERROR`), consumed by reading it.
	pub(crate) fn take_error(&self) -> Result<i32, Error> {
		getsockopt(self.raw(), sockopt::SocketError)
			.map_err(|errno| Error::syscall("getsockopt", errno))
	}

	pub(crate) fn local_name(&self) -> Result<SockaddrStorage, Error> {
		getsockname(self.raw())
			.map_err(|errno| Error::syscall("getsockname", errno))
	}

	/// Raw `getpeername`. The connect state machine probes this to tell a
	/// completed connect from a spurious readiness notification, so the
	/// errno must come through unmapped.
	pub(crate) fn peer_name(&self) -> nix::Result<SockaddrStorage> {
		getpeername(self.raw())
	}

	/// Accept one inbound connection, suspending until a peer arrives.
	///
	/// The accepted descriptor is brand new, independently owned, and has
	/// non-blocking and close-on-exec applied atomically.
	pub(crate) async fn accept(&self) -> Result<NetFd, Error> {
		loop {
			self.ensure_open()?;
			let mut guard = self.io.readable().await?;
			self.ensure_open()?;
			match accept4(
				self.raw(),
				SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
			) {
				Ok(fd) => return NetFd::from_raw(fd, self.family),
				Err(Errno::EAGAIN) => guard.clear_ready(),
				// A peer that resets before we accept is not our caller's
				// problem; take the next one.
				Err(Errno::EINTR | Errno::ECONNABORTED) => {}
				Err(errno) => return Err(Error::syscall("accept", errno)),
			}
		}
	}

	/// Receive into `buf`, suspending until data or EOF. Returns the number
	/// of bytes read; 0 means the peer closed its end.
	pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
		loop {
			self.ensure_open()?;
			let mut guard = self.io.readable().await?;
			self.ensure_open()?;
			match recv(self.raw(), buf, MsgFlags::empty()) {
				Ok(n) => return Ok(n),
				Err(Errno::EAGAIN) => guard.clear_ready(),
				Err(Errno::EINTR) => {}
				Err(errno) => return Err(Error::syscall("recv", errno)),
			}
		}
	}

	/// Send all of `buf`, suspending while the socket buffer is full.
	pub(crate) async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
		let mut sent = 0;
		while sent < buf.len() {
			self.ensure_open()?;
			let mut guard = self.io.writable().await?;
			self.ensure_open()?;
			match send(self.raw(), &buf[sent..], MsgFlags::empty()) {
				Ok(n) => sent += n,
				Err(Errno::EAGAIN) => guard.clear_ready(),
				Err(Errno::EINTR) => {}
				Err(errno) => return Err(Error::syscall("send", errno)),
			}
		}
		Ok(sent)
	}
}
