//! The per-connection model handed from listeners to the dispatcher.
//!
//! A listener turns an accepted peer into exactly one [`Connection`]: the
//! peer's source address, the requested destination (if the protocol
//! negotiates one), the client transport, and a [`Replies`] object that
//! knows how to write that protocol's wire replies at the two dispatch
//! phases. The dispatcher and connectors never know which protocol a
//! connection arrived over; the [`Replies`] seam is the only bridge from
//! abstract pipeline outcomes to protocol bytes.

use std::{
	fmt::{Debug, Display, Formatter, Result as FmtResult},
	io::Result as IoResult,
	net::SocketAddr,
};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{header::HeaderMap, Method, Uri};
use rand::{distributions::Alphanumeric, Rng};
use strum::Display as EnumDisplay;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{addr::Destination, connector::DialError, ruleset::RulesetError};

/// A unique identifier assigned to every accepted connection, used to
/// correlate log lines across the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(String);

impl ConnId {
	/// Generate a new random connection id
	#[must_use]
	pub fn generate() -> Self {
		Self(
			rand::thread_rng()
				.sample_iter(&Alphanumeric)
				.take(12)
				.map(char::from)
				.collect(),
		)
	}

	/// Whether this id is non-empty (always true for generated ids)
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl Display for ConnId {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_str(&self.0)
	}
}

/// The kind of server a connection was accepted by
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum ServerKind {
	/// Plain HTTP proxy
	Http,
	/// TLS-wrapped HTTP proxy
	Https,
	/// SOCKS5 proxy
	Socks5,
	/// Static TCP forwarder
	Tcp,
	/// Static UDP forwarder
	Udp,
}

/// Object-safe alias for the client transport: any bidirectional async
/// stream (plain TCP, or TLS-wrapped TCP for the HTTPS listener).
pub trait ClientIo: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ClientIo for T {}

/// A boxed client transport
pub type ClientStream = Box<dyn ClientIo>;

/// A fully-buffered HTTP request to be replayed upstream on behalf of the
/// client (the plain, non-CONNECT proxy path).
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
	/// The request method
	pub method: Method,
	/// The absolute request URI as sent to the proxy
	pub uri: Uri,
	/// End-to-end request headers (hop-by-hop headers already removed),
	/// preserving multi-value insertion order
	pub headers: HeaderMap,
	/// The request body
	pub body: Bytes,
}

/// What the connection carries: a raw stream to tunnel, or a parsed HTTP
/// request to round-trip. The stream is always present — for the round-trip
/// variant it is where the upstream's response gets written.
pub enum ClientChannel {
	/// Tunnel bytes between the client stream and the upstream
	Stream(ClientStream),
	/// Perform the request upstream and relay the response onto the stream
	Http {
		/// The parsed client request
		request: ProxiedRequest,
		/// The client transport the response is written to
		stream: ClientStream,
	},
}

impl ClientChannel {
	/// Borrow the client stream regardless of variant
	pub fn stream_mut(&mut self) -> &mut ClientStream {
		match self {
			Self::Stream(stream) | Self::Http { stream, .. } => stream,
		}
	}
}

impl Debug for ClientChannel {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Stream(_) => fmt.write_str("ClientChannel::Stream"),
			Self::Http { request, .. } => fmt
				.debug_struct("ClientChannel::Http")
				.field("request", request)
				.finish_non_exhaustive(),
		}
	}
}

/// One accepted peer, immutable after the listener handshake.
pub struct Connection {
	/// The unique id of this connection
	pub id: ConnId,
	/// The kind of server that accepted the peer
	pub kind: ServerKind,
	/// The address the peer connected from
	pub source: SocketAddr,
	/// The destination the peer asked for. `None` for forward-mode
	/// listeners, whose destination comes from the router instead.
	pub destination: Option<Destination>,
	/// The authenticated identity (username), if the listener performed
	/// authentication
	pub identity: Option<String>,
	/// The client transport and, for the round-trip path, the request
	pub channel: ClientChannel,
	/// The protocol reply writer for this connection's dispatch phases
	pub replies: Box<dyn Replies>,
}

impl Debug for Connection {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.debug_struct("Connection")
			.field("id", &self.id)
			.field("kind", &self.kind)
			.field("source", &self.source)
			.field("destination", &self.destination)
			.field("identity", &self.identity)
			.field("channel", &self.channel)
			.finish_non_exhaustive()
	}
}

/// Protocol-level wire replies for the dispatch phases of one connection.
///
/// Implementations are stateless apart from whatever they captured at accept
/// time (e.g. the listener's bind address for SOCKS5 reply records); the
/// client stream is borrowed from the [`Connection`] for each call. Every
/// method defaults to a no-op, and every implementation must be idempotent
/// about its own reply: firing a phase twice must not write two replies.
#[async_trait]
pub trait Replies: Send + Sync {
	/// Called right after the ruleset decision. Implementations write their
	/// protocol's deny reply when the outcome is [`RulesetError::Denied`].
	///
	/// # Errors
	/// Returns the underlying IO error if the reply can not be written.
	async fn after_ruleset(
		&self,
		stream: &mut ClientStream,
		outcome: &Result<(), RulesetError>,
	) -> IoResult<()> {
		let _ = (stream, outcome);
		Ok(())
	}

	/// Called right after the upstream dial, before any data is relayed.
	/// Implementations write their protocol's success reply on `Ok` and a
	/// failure reply classified from the [`DialError`] on `Err`.
	///
	/// # Errors
	/// Returns the underlying IO error if the reply can not be written.
	async fn after_dial(
		&self,
		stream: &mut ClientStream,
		outcome: Result<(), &DialError>,
	) -> IoResult<()> {
		let _ = (stream, outcome);
		Ok(())
	}
}

/// A [`Replies`] with no wire replies at all, used by forward-mode
/// listeners, whose clients never negotiated a proxy protocol.
#[derive(Debug, Default)]
pub struct NoReplies;

#[async_trait]
impl Replies for NoReplies {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conn_id_generated_non_empty() {
		let id = ConnId::generate();

		assert!(!id.is_empty());
		assert_eq!(id.to_string().len(), 12);
	}

	#[test]
	fn conn_ids_unique() {
		let a = ConnId::generate();
		let b = ConnId::generate();

		assert_ne!(a, b);
	}
}
