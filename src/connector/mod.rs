//! Upstream connectors: dialing and serving routed connections.
//!
//! A connector owns the upstream side of one connection from dial to
//! return. There are two variants, selected by the routed destination's
//! network: the [`StreamConnector`] tunnels bytes over TCP, and the
//! [`HrtpConnector`] performs a plain HTTP request upstream and relays the
//! response. Both share the same dial options and the same contract: fire
//! the dialed reply, then serve until one side is done.

mod hrtp;
mod stream;

use std::{
	io::{Error as IoError, ErrorKind},
	time::Duration,
};

pub use hrtp::HrtpConnector;
use socket2::{SockRef, TcpKeepalive};
pub use stream::StreamConnector;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{
	addr::{Address, Network},
	router::Routed,
};

/// Options applied to every dialed upstream socket, and the idle deadlines
/// used while relaying.
#[derive(Debug, Clone)]
pub struct DialOptions {
	/// How long a read may sit idle before the connection is torn down
	pub read_timeout: Duration,
	/// How long a write may sit idle before the connection is torn down
	pub write_timeout: Duration,
	/// Socket and relay buffer size in bytes
	pub buffer_size: usize,
	/// Disable Nagle's algorithm on the upstream socket
	pub nodelay: bool,
	/// TCP keepalive probe time on the upstream socket
	pub keepalive: Duration,
}

impl Default for DialOptions {
	fn default() -> Self {
		Self {
			read_timeout: Duration::from_secs(30),
			write_timeout: Duration::from_secs(10),
			buffer_size: 1024,
			nodelay: true,
			keepalive: Duration::from_secs(10),
		}
	}
}

/// Why an upstream dial failed, as classified from the OS error. Wire
/// protocols map these onto their own failure replies (e.g. the SOCKS5
/// reply byte).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DialErrorKind {
	/// The destination actively refused the connection
	Refused,
	/// No route to the destination network
	NetworkUnreachable,
	/// The destination host is unreachable
	HostUnreachable,
	/// Anything else (treated as host-unreachable by SOCKS5)
	Other,
}

/// The error returned when an upstream dial fails
#[derive(Debug, Error)]
#[error("dialing {destination} failed")]
pub struct DialError {
	/// The destination that was being dialed
	pub destination: Address,
	/// The underlying IO error
	#[source]
	pub source: IoError,
}

impl DialError {
	/// Classify this error for protocol-level reporting. Classification is
	/// by [`ErrorKind`] and OS error code; the error message is only
	/// consulted for errors the OS reports without a usable kind.
	#[must_use]
	pub fn kind(&self) -> DialErrorKind {
		match self.source.kind() {
			ErrorKind::ConnectionRefused => DialErrorKind::Refused,
			ErrorKind::NetworkUnreachable => DialErrorKind::NetworkUnreachable,
			ErrorKind::HostUnreachable => DialErrorKind::HostUnreachable,
			ErrorKind::TimedOut => DialErrorKind::HostUnreachable,
			_ => {
				let msg = self.source.to_string();

				if msg.contains("connection refused") {
					DialErrorKind::Refused
				} else if msg.contains("network is unreachable") {
					DialErrorKind::NetworkUnreachable
				} else {
					DialErrorKind::Other
				}
			}
		}
	}
}

/// The error returned when a connector can not serve a connection
#[derive(Debug, Error)]
pub enum ConnectError {
	/// The upstream dial failed; the dialed reply has already been fired
	#[error(transparent)]
	Dial(#[from] DialError),
	/// A protocol reply could not be written to the client
	#[error("writing the protocol reply failed")]
	Reply(#[source] IoError),
	/// Relaying data between the peers failed
	#[error("relaying data failed")]
	Relay(#[source] IoError),
	/// The upstream HTTP round trip failed
	#[error("upstream round trip failed")]
	RoundTrip(#[source] hyper::Error),
	/// The connection's channel does not match this connector
	#[error("connection channel does not match the connector")]
	ChannelMismatch,
}

/// Dial the destination address and apply [`DialOptions`] to the new
/// socket. Stream destinations have been resolved to an IP literal by the
/// dispatch pipeline; round-trip destinations may still carry a domain,
/// which the OS resolves here.
///
/// # Errors
/// Returns a [`DialError`] wrapping the OS error on failure.
pub async fn dial(address: &Address, opts: &DialOptions) -> Result<TcpStream, DialError> {
	let dial_err = |source| DialError {
		destination: address.clone(),
		source,
	};

	let stream = match address.socket_addr() {
		Some(addr) => TcpStream::connect(addr).await,
		None => match address.host.as_domain() {
			Some(domain) => TcpStream::connect((domain, address.port)).await,
			None => Err(IoError::new(
				ErrorKind::InvalidInput,
				"destination has no dialable host",
			)),
		},
	}
	.map_err(dial_err)?;

	stream.set_nodelay(opts.nodelay).map_err(dial_err)?;

	let socket = SockRef::from(&stream);
	socket
		.set_tcp_keepalive(&TcpKeepalive::new().with_time(opts.keepalive))
		.map_err(dial_err)?;
	socket
		.set_recv_buffer_size(opts.buffer_size)
		.map_err(dial_err)?;
	socket
		.set_send_buffer_size(opts.buffer_size)
		.map_err(dial_err)?;

	Ok(stream)
}

/// An upstream connector, one variant per supported destination network.
#[derive(Debug)]
pub enum Connector {
	/// Byte tunneling over TCP
	Stream(StreamConnector),
	/// HTTP round trip on behalf of the client
	Hrtp(HrtpConnector),
}

impl Connector {
	/// Whether this connector serves destinations on `network`
	#[must_use]
	pub const fn supports(&self, network: Network) -> bool {
		match self {
			Self::Stream(_) => matches!(network, Network::Tcp),
			Self::Hrtp(_) => matches!(network, Network::Hrtp),
		}
	}

	/// Dial the routed destination and serve the connection until either
	/// side is done. Fires the connection's dialed reply with the dial
	/// outcome before any data is relayed.
	///
	/// # Errors
	/// Returns a [`ConnectError`]; the caller decides which of these are
	/// worth reporting (peer-initiated closes are not).
	pub async fn dial_serve(
		&self,
		cancel: &CancellationToken,
		routed: &mut Routed,
	) -> Result<(), ConnectError> {
		match self {
			Self::Stream(connector) => connector.dial_serve(cancel, routed).await,
			Self::Hrtp(connector) => connector.dial_serve(cancel, routed).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn classified(err: IoError) -> DialErrorKind {
		DialError {
			destination: "127.0.0.1:1".parse().unwrap(),
			source: err,
		}
		.kind()
	}

	#[test]
	fn classify_by_kind() {
		assert_eq!(
			classified(IoError::from(ErrorKind::ConnectionRefused)),
			DialErrorKind::Refused
		);
		assert_eq!(
			classified(IoError::from(ErrorKind::NetworkUnreachable)),
			DialErrorKind::NetworkUnreachable
		);
		assert_eq!(
			classified(IoError::from(ErrorKind::HostUnreachable)),
			DialErrorKind::HostUnreachable
		);
	}

	#[test]
	fn classify_by_message_fallback() {
		assert_eq!(
			classified(IoError::other("connect: connection refused")),
			DialErrorKind::Refused
		);
		assert_eq!(
			classified(IoError::other("connect: network is unreachable")),
			DialErrorKind::NetworkUnreachable
		);
		assert_eq!(
			classified(IoError::other("something else entirely")),
			DialErrorKind::Other
		);
	}

	#[tokio::test]
	async fn dial_refused() {
		// Port 1 on loopback is almost certainly closed
		let err = dial(&"127.0.0.1:1".parse().unwrap(), &DialOptions::default())
			.await
			.unwrap_err();

		assert_eq!(err.kind(), DialErrorKind::Refused);
	}

	#[tokio::test]
	async fn dial_unresolvable_domain() {
		// Round-trip destinations are not pre-resolved; the OS lookup
		// fails for a nonexistent name
		let err = dial(
			&"definitely-not-a-real-host.invalid:80".parse().unwrap(),
			&DialOptions::default(),
		)
		.await
		.unwrap_err();

		assert_eq!(err.kind(), DialErrorKind::Other);
	}
}
