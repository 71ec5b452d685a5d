//! Stream transport for the VSOCK address family (host <-> guest virtual
//! machine communication), with `dial`/`listen`/`accept` semantics over raw
//! `(context id, port)` endpoints.
//!
//! Connection establishment is fully non-blocking: the connect syscall is
//! issued against a `SOCK_NONBLOCK` descriptor and completion is polled
//! through the reactor's writability notifications, racing an optional
//! cancellation source ([`Cancel`]). Established connections are plain
//! duplex byte streams with per-direction deadlines.
//!
//! ```no_run
//! use vsock_transport::{dial, listen, Addr};
//!
//! # async fn run() -> Result<(), vsock_transport::Error> {
//! let listener = listen("vsock", Addr::new(3, 5000))?;
//! let client = dial("vsock", None, Addr::new(3, 5000)).await?;
//! let served = listener.accept().await?;
//!
//! client.write(b"ping").await?;
//! let mut buf = [0u8; 4];
//! served.read(&mut buf).await?;
//! # Ok(()) }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod addr;
pub mod conn;
pub mod dial;
pub mod error;
mod fd;
pub mod listener;

pub use addr::{
	local_context_id, Addr, VMADDR_CID_ANY, VMADDR_CID_HOST,
	VMADDR_CID_HYPERVISOR, VMADDR_CID_LOCAL, VMADDR_PORT_ANY,
};
pub use conn::Connection;
pub use dial::{dial, dial_with_cancel, Cancel, CancelHandle};
pub use error::Error;
pub use listener::{listen, listen_with_backlog, Listener, DEFAULT_BACKLOG};

/// The network identifier this transport answers to.
pub const NETWORK: &str = "vsock";
