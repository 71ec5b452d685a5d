//! Established duplex sessions.

use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

use crate::addr::Addr;
use crate::error::Error;
use crate::fd::NetFd;

/// An established vsock connection: a raw duplex byte stream over one
/// exclusively-owned socket, with per-direction deadlines.
///
/// No buffering or framing is performed. Concurrent readers or writers are
/// the caller's responsibility; [`close`](Self::close) is the one operation
/// that is safe to race with in-flight I/O and unblocks it with
/// [`Error::Closed`].
#[derive(Debug)]
pub struct Connection {
	fd: NetFd,
	laddr: Addr,
	raddr: Addr,
	read_deadline: Mutex<Option<Instant>>,
	write_deadline: Mutex<Option<Instant>>,
}

fn load(slot: &Mutex<Option<Instant>>) -> Option<Instant> {
	*slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn store(slot: &Mutex<Option<Instant>>, value: Option<Instant>) {
	*slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

impl Connection {
	pub(crate) fn new(fd: NetFd, laddr: Addr, raddr: Addr) -> Self {
		Self {
			fd,
			laddr,
			raddr,
			read_deadline: Mutex::new(None),
			write_deadline: Mutex::new(None),
		}
	}

	/// Receive into `buf`, suspending until data arrives, the read deadline
	/// elapses, or the connection is closed. Returns the number of bytes
	/// read; 0 means the peer closed its end.
	///
	/// A read deadline already in the past fails with [`Error::TimedOut`]
	/// without touching the socket.
	pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
		match load(&self.read_deadline) {
			Some(deadline) => {
				if deadline <= Instant::now() {
					return Err(Error::TimedOut);
				}
				tokio::time::timeout_at(deadline, self.fd.read(buf)).await?
			}
			None => self.fd.read(buf).await,
		}
	}

	/// Send all of `buf`, suspending while the socket buffer is full, until
	/// the write deadline elapses or the connection is closed. On success
	/// the returned count is always `buf.len()`.
	///
	/// On error the transfer count is not reported: the kernel may already
	/// have accepted a prefix of `buf`, so after [`Error::TimedOut`] or
	/// [`Error::Closed`] mid-transfer the stream position is unknown and the
	/// connection should be torn down rather than resumed.
	///
	/// A write deadline already in the past fails with [`Error::TimedOut`]
	/// without touching the socket.
	pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
		match load(&self.write_deadline) {
			Some(deadline) => {
				if deadline <= Instant::now() {
					return Err(Error::TimedOut);
				}
				tokio::time::timeout_at(deadline, self.fd.write(buf)).await?
			}
			None => self.fd.write(buf).await,
		}
	}

	/// Close the connection, unblocking any in-flight operation with
	/// [`Error::Closed`]. A second close fails with [`Error::Closed`].
	pub fn close(&self) -> Result<(), Error> {
		self.fd.close()
	}

	/// The OS-reported bound local address of this connection.
	#[must_use]
	pub fn local_addr(&self) -> Addr {
		self.laddr
	}

	/// The confirmed peer address of this connection.
	#[must_use]
	pub fn remote_addr(&self) -> Addr {
		self.raddr
	}

	/// Set both direction deadlines. `None` clears them; an elapsed
	/// deadline only fails the operations it governs, later deadlines are
	/// honored again.
	pub fn set_deadline(&self, deadline: Option<Instant>) {
		self.set_read_deadline(deadline);
		self.set_write_deadline(deadline);
	}

	/// Set the deadline for reads only.
	pub fn set_read_deadline(&self, deadline: Option<Instant>) {
		store(&self.read_deadline, deadline);
	}

	/// Set the deadline for writes only.
	pub fn set_write_deadline(&self, deadline: Option<Instant>) {
		store(&self.write_deadline, deadline);
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use nix::sys::socket::{
		socketpair, AddressFamily, SockFlag, SockType,
	};

	use super::*;

	fn pair() -> (Connection, Connection) {
		let (a, b) = socketpair(
			AddressFamily::Unix,
			SockType::Stream,
			None,
			SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
		)
		.unwrap();
		let fa = NetFd::from_raw(a, AddressFamily::Unix).unwrap();
		let fb = NetFd::from_raw(b, AddressFamily::Unix).unwrap();
		(
			Connection::new(fa, Addr::new(3, 5000), Addr::new(3, 5001)),
			Connection::new(fb, Addr::new(3, 5001), Addr::new(3, 5000)),
		)
	}

	#[tokio::test]
	async fn ping_round_trips_byte_exact() {
		let (client, server) = pair();

		assert_eq!(client.write(b"ping").await.unwrap(), 4);
		let mut buf = [0u8; 16];
		let n = server.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"ping");

		assert_eq!(server.write(b"pong").await.unwrap(), 4);
		let n = client.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"pong");
	}

	#[tokio::test]
	async fn past_read_deadline_fails_immediately() {
		let (client, server) = pair();

		client
			.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));
		let mut buf = [0u8; 4];
		assert!(matches!(
			client.read(&mut buf).await,
			Err(Error::TimedOut)
		));

		// deadlines are resettable and do not poison later operations
		client.set_read_deadline(None);
		server.write(b"late").await.unwrap();
		let n = client.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"late");
	}

	#[tokio::test]
	async fn read_deadline_bounds_the_wait() {
		let (client, _server) = pair();

		client.set_read_deadline(Some(
			Instant::now() + Duration::from_millis(100),
		));
		let started = Instant::now();
		let mut buf = [0u8; 4];
		assert!(matches!(
			client.read(&mut buf).await,
			Err(Error::TimedOut)
		));
		assert!(started.elapsed() >= Duration::from_millis(100));
		assert!(started.elapsed() < Duration::from_secs(5));
	}

	#[tokio::test]
	async fn write_deadline_bounds_a_stalled_transfer() {
		let (client, _server) = pair();

		// far more than the socket buffer holds, with nobody reading: the
		// transfer stalls mid-way and the deadline fires
		let payload = vec![0u8; 1 << 22];
		client.set_write_deadline(Some(
			Instant::now() + Duration::from_millis(100),
		));
		let started = Instant::now();
		assert!(matches!(
			client.write(&payload).await,
			Err(Error::TimedOut)
		));
		assert!(started.elapsed() >= Duration::from_millis(100));
		assert!(started.elapsed() < Duration::from_secs(5));

		// a prefix may have been accepted by the kernel; the handle is torn
		// down rather than resumed
		client.close().unwrap();
	}

	#[tokio::test]
	async fn double_close_errors_on_second_call() {
		let (client, _server) = pair();
		client.close().unwrap();
		assert!(matches!(client.close(), Err(Error::Closed)));

		let mut buf = [0u8; 1];
		assert!(matches!(client.read(&mut buf).await, Err(Error::Closed)));
	}

	#[tokio::test]
	async fn peer_close_reads_as_eof() {
		let (client, server) = pair();
		drop(server);

		let mut buf = [0u8; 4];
		assert_eq!(client.read(&mut buf).await.unwrap(), 0);
	}

	#[test]
	fn address_accessors() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_io()
			.build()
			.unwrap();
		let _guard = rt.enter();
		let (client, _server) = pair();
		assert_eq!(client.local_addr(), Addr::new(3, 5000));
		assert_eq!(client.remote_addr(), Addr::new(3, 5001));
	}
}
