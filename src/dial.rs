//! Outbound connection establishment.
//!
//! The connect state machine: issue a non-blocking connect, classify the
//! immediate errno, then poll `SO_ERROR` on writability until the attempt
//! resolves, racing an optional cancellation source the whole way.

use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockaddrLike, SockaddrStorage};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::addr::Addr;
use crate::conn::Connection;
use crate::error::Error;
use crate::fd::NetFd;
use crate::NETWORK;

/// Cooperative cancellation source for an in-flight dial: an optional
/// absolute deadline, an optional explicit trigger, or neither.
///
/// ```no_run
/// use tokio::time::{Duration, Instant};
/// use vsock_transport::{dial_with_cancel, Addr, Cancel};
///
/// # async fn run() -> Result<(), vsock_transport::Error> {
/// let cancel = Cancel::with_deadline(Instant::now() + Duration::from_secs(5));
/// let _conn = dial_with_cancel("vsock", None, Addr::new(3, 5000), cancel).await?;
/// # Ok(()) }
/// ```
#[derive(Clone, Debug, Default)]
pub struct Cancel {
	deadline: Option<Instant>,
	signal: Option<watch::Receiver<bool>>,
}

/// Trigger half of [`Cancel::manual`]. Dropping it without calling
/// [`cancel`](Self::cancel) never cancels anything.
#[derive(Debug)]
pub struct CancelHandle {
	tx: watch::Sender<bool>,
}

impl CancelHandle {
	/// Cancel the dial this handle was created for.
	pub fn cancel(&self) {
		let _ = self.tx.send(true);
	}
}

impl Cancel {
	/// Cancel automatically once `deadline` passes.
	#[must_use]
	pub fn with_deadline(deadline: Instant) -> Self {
		Self { deadline: Some(deadline), signal: None }
	}

	/// An explicitly-triggered cancellation source.
	#[must_use]
	pub fn manual() -> (Self, CancelHandle) {
		let (tx, rx) = watch::channel(false);
		(Self { deadline: None, signal: Some(rx) }, CancelHandle { tx })
	}

	/// Additionally cancel once `deadline` passes.
	#[must_use]
	pub fn deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);
		self
	}

	/// A source that can never fire needs no canceller task.
	fn is_inert(&self) -> bool {
		self.deadline.is_none() && self.signal.is_none()
	}

	fn is_canceled(&self) -> bool {
		if self.deadline.is_some_and(|d| d <= Instant::now()) {
			return true;
		}
		self.signal.as_ref().is_some_and(|rx| *rx.borrow())
	}

	/// The error a cancellation resolves to right now: the explicit trigger
	/// takes precedence over the deadline.
	fn err_now(&self) -> Error {
		if self.signal.as_ref().is_some_and(|rx| *rx.borrow()) {
			return Error::Canceled;
		}
		Error::TimedOut
	}

	/// Suspend until this source fires; pending forever if it never does.
	async fn fired(&self) -> Error {
		let deadline = async {
			match self.deadline {
				Some(d) => tokio::time::sleep_until(d).await,
				None => std::future::pending().await,
			}
		};
		let signal = async {
			match self.signal.clone() {
				Some(mut rx) => loop {
					if *rx.borrow() {
						break;
					}
					if rx.changed().await.is_err() {
						// handle dropped without firing
						std::future::pending::<()>().await;
					}
				},
				None => std::future::pending().await,
			}
		};
		tokio::select! {
			() = deadline => Error::TimedOut,
			() = signal => Error::Canceled,
		}
	}
}

/// Connect to `remote`, optionally pre-binding `local`, suspending until the
/// connection is established.
///
/// `network` must be `"vsock"`; anything else fails with
/// [`Error::UnsupportedNetwork`] before a single syscall is issued.
pub async fn dial(
	network: &str,
	local: Option<Addr>,
	remote: Addr,
) -> Result<Connection, Error> {
	dial_with_cancel(network, local, remote, Cancel::default()).await
}

/// [`dial`], governed by a cancellation source.
///
/// If `cancel` fires before the connection is established the dial resolves
/// to [`Error::TimedOut`] or [`Error::Canceled`] within a bounded time and
/// the underlying descriptor is released.
pub async fn dial_with_cancel(
	network: &str,
	local: Option<Addr>,
	remote: Addr,
	cancel: Cancel,
) -> Result<Connection, Error> {
	if network != NETWORK {
		return Err(Error::UnsupportedNetwork(network.to_string()));
	}
	let fd = NetFd::open(AddressFamily::Vsock)?;
	match dial_fd(&fd, local, remote, &cancel).await {
		Ok((laddr, raddr)) => Ok(Connection::new(fd, laddr, raddr)),
		Err(err) => {
			// no descriptor leaks on any failure path; the fd itself is
			// released when `fd` drops right after
			let _ = fd.close();
			Err(err)
		}
	}
}

async fn dial_fd(
	fd: &NetFd,
	local: Option<Addr>,
	remote: Addr,
	cancel: &Cancel,
) -> Result<(Addr, Addr), Error> {
	if let Some(local) = local {
		fd.bind(&local.to_vsock())?;
	}
	let confirmed = establish(fd, &remote.to_vsock(), cancel).await?;

	// Local address always comes from the OS after connect. For the remote,
	// prefer the peer confirmed by the completion poll, then the current OS
	// peer, then the caller-supplied target.
	let laddr = Addr::from_storage(&fd.local_name()?)?;
	let raddr = match confirmed {
		Some(storage) => Addr::from_storage(&storage)?,
		None => match fd.peer_name() {
			Ok(storage) => Addr::from_storage(&storage)?,
			Err(_) => remote,
		},
	};
	Ok((laddr, raddr))
}

/// One round of completion classification after a writability wakeup.
enum Progress {
	/// Still in flight; includes spurious wakeups where `SO_ERROR` is clear
	/// but the peer is not reachable yet.
	Pending,
	/// Connected, with the confirmed peer address when the OS reported one.
	Connected(Option<SockaddrStorage>),
}

fn check_progress(fd: &NetFd) -> Result<Progress, Error> {
	match fd.take_error()? {
		0 => match fd.peer_name() {
			Ok(storage) => Ok(Progress::Connected(Some(storage))),
			// The reactor can wake us spuriously. A clear SO_ERROR is not
			// proof of a connection; re-poll until the peer is queryable.
			Err(_) => Ok(Progress::Pending),
		},
		raw => match Errno::from_i32(raw) {
			Errno::EINPROGRESS | Errno::EALREADY | Errno::EINTR => {
				Ok(Progress::Pending)
			}
			Errno::EISCONN => Ok(Progress::Connected(None)),
			errno => Err(Error::syscall("connect", errno)),
		},
	}
}

/// Drive `fd` to the connected state against `remote`.
///
/// Returns the confirmed peer address when the completion poll produced one.
/// On cancellation the handle is closed before the error is returned.
pub(crate) async fn establish(
	fd: &NetFd,
	remote: &dyn SockaddrLike,
	cancel: &Cancel,
) -> Result<Option<SockaddrStorage>, Error> {
	match fd.start_connect(remote) {
		Ok(()) | Err(Errno::EISCONN) => {
			if cancel.is_canceled() {
				return Err(cancel.err_now());
			}
			return Ok(None);
		}
		Err(Errno::EINPROGRESS | Errno::EALREADY | Errno::EINTR) => {}
		Err(errno) => return Err(Error::syscall("connect", errno)),
	}

	if cancel.is_inert() {
		return poll_connected(fd).await;
	}
	poll_connected_with_cancel(fd, cancel).await
}

/// Completion poll with no cancellation source in play.
async fn poll_connected(
	fd: &NetFd,
) -> Result<Option<SockaddrStorage>, Error> {
	loop {
		fd.ensure_open()?;
		let mut guard = fd.io().writable().await?;
		fd.ensure_open()?;
		match check_progress(fd)? {
			Progress::Connected(storage) => return Ok(storage),
			Progress::Pending => guard.clear_ready(),
		}
	}
}

/// Completion poll racing a canceller task.
///
/// The canceller waits on the cancellation source against a done signal and
/// interrupts the writability wait when it fires. The completion path always
/// collects the canceller's verdict before returning: if cancellation fired
/// first it wins even when the connect resolved in the meantime, and the
/// handle is closed either way.
async fn poll_connected_with_cancel(
	fd: &NetFd,
	cancel: &Cancel,
) -> Result<Option<SockaddrStorage>, Error> {
	let (interrupt_tx, mut interrupt_rx) = oneshot::channel::<()>();
	let (done_tx, done_rx) = oneshot::channel::<()>();
	let source = cancel.clone();
	let canceller = tokio::spawn(async move {
		tokio::select! {
			err = source.fired() => {
				let _ = interrupt_tx.send(());
				Some(err)
			}
			_ = done_rx => None,
		}
	});

	let mut preempted = false;
	let completion = loop {
		if fd.is_closed() {
			break Err(Error::Closed);
		}
		let wait = tokio::select! {
			res = fd.io().writable() => Some(res),
			_ = &mut interrupt_rx => None,
		};
		let Some(res) = wait else {
			preempted = true;
			break Ok(None);
		};
		let mut guard = match res {
			Ok(guard) => guard,
			Err(err) => break Err(err.into()),
		};
		match check_progress(fd) {
			Ok(Progress::Connected(storage)) => break Ok(storage),
			Ok(Progress::Pending) => guard.clear_ready(),
			Err(err) => break Err(err),
		}
	};

	// Single resolution: unblock the canceller and wait for it to unwind
	// before returning.
	drop(done_tx);
	let verdict = canceller.await.unwrap_or(None);
	match (completion, verdict) {
		(completion, None) => completion,
		// The completion poll failed before cancellation fired; its error
		// stands. The caller closes the handle on every dial failure.
		(Err(err), Some(_)) if !preempted => Err(err),
		(_, Some(err)) => {
			let _ = fd.close();
			Err(err)
		}
	}
}
