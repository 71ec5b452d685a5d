//! Transport error taxonomy.

use std::fmt;

use nix::errno::Errno;

/// Errors surfaced by the vsock transport.
///
/// OS failures keep the underlying [`Errno`] and the name of the failing
/// syscall so callers can tell a bind failure from a connect failure.
#[derive(Debug)]
pub enum Error {
	/// The caller asked for a network this transport does not implement.
	/// Checked before any syscall is issued.
	UnsupportedNetwork(String),
	/// A native socket address could not be converted to a vsock address.
	InvalidAddress(String),
	/// A syscall failed. `op` names the failing operation
	/// (`bind`/`listen`/`connect`/`accept`/`getsockopt`/...).
	Syscall {
		/// Name of the failing syscall.
		op: &'static str,
		/// The OS error code, unmodified.
		errno: Errno,
	},
	/// Operation attempted on a handle that was already closed.
	Closed,
	/// A deadline elapsed before the operation completed.
	TimedOut,
	/// The operation was canceled by an explicit cancel signal.
	Canceled,
	/// `std::io::Error` wrapper, e.g. from reactor registration.
	StdIoError(std::io::Error),
}

impl Error {
	pub(crate) fn syscall(op: &'static str, errno: Errno) -> Self {
		Self::Syscall { op, errno }
	}

	/// The OS error code carried by this error, if any.
	#[must_use]
	pub fn errno(&self) -> Option<Errno> {
		match self {
			Self::Syscall { errno, .. } => Some(*errno),
			_ => None,
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::UnsupportedNetwork(network) => {
				write!(f, "unsupported network: {network}")
			}
			Self::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
			Self::Syscall { op, errno } => write!(f, "{op}: {errno}"),
			Self::Closed => write!(f, "use of closed handle"),
			Self::TimedOut => write!(f, "deadline elapsed"),
			Self::Canceled => write!(f, "operation canceled"),
			Self::StdIoError(err) => write!(f, "io error: {err}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Syscall { errno, .. } => Some(errno),
			Self::StdIoError(err) => Some(err),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::StdIoError(err)
	}
}

impl From<tokio::time::error::Elapsed> for Error {
	fn from(_: tokio::time::error::Elapsed) -> Self {
		Self::TimedOut
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn display_tags_the_failing_operation() {
		let err = Error::syscall("bind", Errno::EADDRINUSE);
		assert!(err.to_string().starts_with("bind: "));
		assert_eq!(err.errno(), Some(Errno::EADDRINUSE));
	}

	#[test]
	fn elapsed_maps_to_timeout() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_time()
			.build()
			.unwrap();
		let err: Error = rt.block_on(async {
			tokio::time::timeout(
				std::time::Duration::ZERO,
				std::future::pending::<()>(),
			)
			.await
			.unwrap_err()
			.into()
		});
		assert!(matches!(err, Error::TimedOut));
	}
}
