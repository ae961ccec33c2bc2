//! Listeners: the protocol front ends of conduit.
//!
//! A listener binds a TCP socket, accepts peers until the server's
//! cancellation token fires, performs its protocol's handshake on a task per
//! peer, and hands the resulting [`Connection`](crate::conn::Connection) to
//! the dispatcher. One listener exists per configured protocol/port pair.

pub mod http;
pub mod socks;
pub mod tcp;

use std::{
	io::Error as IoError,
	net::{IpAddr, SocketAddr},
	os::raw::c_int,
	time::Duration,
};

use async_trait::async_trait;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener as TokioTcpListener;
use tokio_util::sync::CancellationToken;

/// Number of incoming connections that can be kept in the TCP socket backlog
/// of a listener (see `listen`'s [linux man page] or [winsock docs] for
/// details)
///
/// [linux man page]: https://linux.die.net/man/2/listen
/// [winsock docs]: https://learn.microsoft.com/en-us/windows/win32/api/winsock2/nf-winsock2-listen
const LISTENER_TCP_BACKLOG_SIZE: c_int = 1024;

/// How long a peer may take to complete its protocol handshake before the
/// connection is dropped
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The error returned when a listener can not be created or run
#[derive(Debug, Error)]
pub enum ListenerError {
	/// The configured port is not usable (zero)
	#[error("invalid listener port: {0}")]
	InvalidPort(u16),
	/// The listening socket could not be set up
	#[error("could not bind {addr}")]
	Bind {
		/// The address that could not be bound
		addr: SocketAddr,
		/// The underlying IO error
		#[source]
		source: IoError,
	},
	/// TLS material could not be loaded
	#[error(transparent)]
	Tls(#[from] crate::certs::CertError),
}

/// Bind address, port, and handshake behavior shared by all listeners.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
	/// The address to bind to
	pub bind: IpAddr,
	/// The TCP port to listen on
	pub port: u16,
	/// Whether the listener requires clients to authenticate during the
	/// handshake
	pub auth: bool,
}

impl ListenerOptions {
	/// Validate the options.
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidPort`] when the port is zero.
	pub const fn validate(&self) -> Result<(), ListenerError> {
		if self.port == 0 {
			return Err(ListenerError::InvalidPort(self.port));
		}

		Ok(())
	}

	/// The socket address the listener will bind
	#[must_use]
	pub const fn socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.bind, self.port)
	}
}

/// A protocol front end, accepting peers until cancelled.
#[async_trait]
pub trait Listener: Send + Sync {
	/// Bind the listening socket and accept peers until `cancel` fires.
	/// Each accepted peer is served on its own task; cancelling `cancel`
	/// stops the accept loop and propagates to in-flight peers.
	///
	/// # Errors
	/// Returns a [`ListenerError`] if the socket can not be bound. Errors
	/// from individual peers are logged, not returned.
	async fn listen(&self, cancel: CancellationToken) -> Result<(), ListenerError>;

	/// The address this listener is configured to bind
	fn bound_addr(&self) -> SocketAddr;
}

/// Set up a listening TCP socket on `addr` the same way for every listener.
///
/// # Errors
/// Returns a [`ListenerError::Bind`] if any socket operation fails.
pub(crate) fn bind_socket(addr: SocketAddr) -> Result<TokioTcpListener, ListenerError> {
	let bind_err = |source| ListenerError::Bind { addr, source };

	let socket = Socket::new(
		Domain::for_address(addr),
		Type::STREAM,
		Some(SocketProtocol::TCP),
	)
	.map_err(bind_err)?;

	// `SO_REUSEADDR` has different meanings across platforms:
	// - On Windows, it allows multiple listeners per socket (which is very bad)
	// - On Unix-like OSs, it allows a process to bind to a recently-closed
	//   socket (which can occasionally speed up socket initialization)
	socket.set_reuse_address(cfg!(unix)).map_err(bind_err)?;
	// Required for Tokio to properly use async listeners
	socket.set_nonblocking(true).map_err(bind_err)?;
	// Improves latency when sending replies
	socket.set_nodelay(true).map_err(bind_err)?;

	socket.bind(&addr.into()).map_err(bind_err)?;
	socket.listen(LISTENER_TCP_BACKLOG_SIZE).map_err(bind_err)?;

	TokioTcpListener::from_std(socket.into()).map_err(bind_err)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn options_validate_port() {
		let valid = ListenerOptions {
			bind: [127, 0, 0, 1].into(),
			port: 1080,
			auth: false,
		};
		let invalid = ListenerOptions { port: 0, ..valid.clone() };

		assert!(valid.validate().is_ok());
		assert!(matches!(
			invalid.validate(),
			Err(ListenerError::InvalidPort(0))
		));
	}

	#[tokio::test]
	async fn bind_socket_ephemeral() {
		let listener = bind_socket(([127, 0, 0, 1], 0).into()).unwrap();

		assert!(listener.local_addr().unwrap().port() != 0);
	}

	#[tokio::test]
	async fn bind_socket_conflict() {
		let first = bind_socket(([127, 0, 0, 1], 0).into()).unwrap();
		let addr = first.local_addr().unwrap();

		assert!(matches!(
			bind_socket(addr),
			Err(ListenerError::Bind { .. })
		));
	}
}
