//! The dispatcher: the per-connection pipeline behind every listener.
//!
//! Listeners authenticate through [`Dispatcher::authenticate`] during their
//! handshake, then hand the finished [`Connection`] to
//! [`Dispatcher::dispatch`], which owns it from there: route, resolve,
//! ruleset check, connector selection, dial, and relay, in that order. Any
//! step's failure short-circuits the rest, but the phase replies still fire
//! so the listener-provided [`Replies`](crate::conn::Replies) writes the
//! protocol-appropriate bytes. The dispatcher itself stays protocol-
//! agnostic.

use std::{io::ErrorKind, sync::Arc, time::Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	addr::{Host, Network},
	auth::{AuthError, Authentication, Authenticator},
	conn::{ConnId, Connection, Replies as _, ServerKind},
	connector::{ConnectError, Connector},
	resolver::{ResolveError, Resolver},
	router::{RouteError, Routed, Router},
	ruleset::{RuleQuery, Ruleset, RulesetError},
};

/// Everything a dispatched connection carries besides the connection
/// itself: its id, the kind of server it arrived through, and its
/// cancellation handle (a fresh child of the server's token).
#[derive(Debug, Clone)]
pub struct DispatchContext {
	/// The connection's unique id
	pub id: ConnId,
	/// The kind of server the connection arrived through
	pub kind: ServerKind,
	/// Cancelling this aborts every in-flight suspension of the connection
	pub cancel: CancellationToken,
}

impl DispatchContext {
	/// Create a dispatch context
	#[must_use]
	pub const fn new(id: ConnId, kind: ServerKind, cancel: CancellationToken) -> Self {
		Self { id, kind, cancel }
	}
}

/// The error produced when a connection's pipeline does not run to
/// completion
#[derive(Debug, Error)]
pub enum DispatchError {
	/// The router produced no destination
	#[error("routing failed")]
	Route(#[from] RouteError),
	/// The destination domain could not be resolved
	#[error("resolution failed")]
	Resolve(#[from] ResolveError),
	/// The ruleset denied the connection; the deny reply has been written
	#[error("denied by ruleset")]
	Denied,
	/// No connector serves the destination's network
	#[error("no connector supports network \"{0}\"")]
	UnsupportedNetwork(Network),
	/// A phase reply could not be written to the client
	#[error("writing the protocol reply failed")]
	Reply(#[source] std::io::Error),
	/// The connector failed while dialing or serving
	#[error(transparent)]
	Connect(#[from] ConnectError),
}

/// The pipeline orchestrator shared by all listeners of one server.
#[derive(Debug)]
pub struct Dispatcher {
	authenticator: Arc<dyn Authenticator>,
	router: Arc<dyn Router>,
	resolver: Arc<dyn Resolver>,
	ruleset: Arc<dyn Ruleset>,
	connectors: Vec<Connector>,
}

impl Dispatcher {
	/// Create a dispatcher from its components. The connectors are tried
	/// in order when selecting by destination network.
	#[must_use]
	pub fn new(
		authenticator: Arc<dyn Authenticator>,
		router: Arc<dyn Router>,
		resolver: Arc<dyn Resolver>,
		ruleset: Arc<dyn Ruleset>,
		connectors: Vec<Connector>,
	) -> Self {
		Self {
			authenticator,
			router,
			resolver,
			ruleset,
			connectors,
		}
	}

	/// Validate a credential collected by a listener during its handshake.
	///
	/// # Errors
	/// Returns the [`AuthError`] from the configured authenticator; the
	/// listener maps it onto its wire protocol.
	pub async fn authenticate(&self, authn: &Authentication) -> Result<(), AuthError> {
		self.authenticator.authenticate(authn).await
	}

	/// Run a connection's pipeline to completion. The dispatcher owns the
	/// connection from here; the outcome is logged, not returned —
	/// listeners have nothing left to do with the peer.
	pub async fn dispatch(&self, cx: DispatchContext, conn: Connection) {
		debug_assert!(!cx.id.is_empty(), "dispatched connection has no id");

		let source = conn.source;
		let started = Instant::now();
		let result = self.serve(&cx, conn).await;
		let duration_ms = started.elapsed().as_millis();

		match result {
			Ok(()) => {
				debug!(id = %cx.id, kind = %cx.kind, %source, duration_ms, "connection finished");
			}
			Err(err) if is_benign(&err) => {
				debug!(
					id = %cx.id,
					kind = %cx.kind,
					%source,
					duration_ms,
					err = %err,
					"connection closed"
				);
			}
			Err(err) => {
				warn!(
					id = %cx.id,
					kind = %cx.kind,
					%source,
					duration_ms,
					err = %err,
					"connection failed"
				);
			}
		}
	}

	/// The pipeline itself: route, resolve, ruleset, select, dial/serve.
	async fn serve(&self, cx: &DispatchContext, conn: Connection) -> Result<(), DispatchError> {
		// Route
		let destination = self.router.route(&conn).await?;
		let mut routed = Routed { destination, conn };

		debug_assert!(routed.destination.is_valid(), "routed destination invalid");

		// Resolve, so connectors only ever see IP literals
		if matches!(routed.destination.network, Network::Tcp | Network::Udp) {
			if let Host::Domain(domain) = &routed.destination.address.host {
				let ip = self.resolver.resolve(domain).await?;
				routed.destination.address.host = Host::Ip(ip);
			}
		}

		// Ruleset; silence means "allow"
		let query = RuleQuery {
			source: routed.conn.source,
			identity: routed.conn.identity.as_deref(),
			destination: &routed.destination,
		};
		let outcome = self.ruleset.authorize(&query).await;
		let outcome = match outcome {
			Ok(()) | Err(RulesetError::NoMatch) => Ok(()),
			Err(RulesetError::Denied) => Err(RulesetError::Denied),
		};

		routed
			.conn
			.replies
			.after_ruleset(routed.conn.channel.stream_mut(), &outcome)
			.await
			.map_err(DispatchError::Reply)?;

		if outcome.is_err() {
			return Err(DispatchError::Denied);
		}

		// Select the connector by destination network
		let network = routed.destination.network;
		let connector = self
			.connectors
			.iter()
			.find(|connector| connector.supports(network))
			.ok_or(DispatchError::UnsupportedNetwork(network))?;

		// Dial and serve; the connector fires the dialed reply itself
		connector.dial_serve(&cx.cancel, &mut routed).await?;

		Ok(())
	}
}

/// Whether a pipeline error is a normal end of a connection's life
/// (peer-initiated close, idle timeout, shutdown) rather than something
/// worth reporting.
fn is_benign(err: &DispatchError) -> bool {
	match err {
		DispatchError::Connect(ConnectError::Relay(io) | ConnectError::Reply(io)) => matches!(
			io.kind(),
			ErrorKind::UnexpectedEof
				| ErrorKind::TimedOut
				| ErrorKind::ConnectionReset
				| ErrorKind::ConnectionAborted
				| ErrorKind::BrokenPipe
				| ErrorKind::NotConnected
				| ErrorKind::Interrupted
		),
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use tokio::{
		io::{duplex, AsyncReadExt, AsyncWriteExt},
		net::TcpListener,
	};

	use super::*;
	use crate::{
		addr::{Address, Destination},
		auth::BasicAuthenticator,
		conn::{ClientChannel, NoReplies},
		connector::{DialOptions, HrtpConnector, StreamConnector},
		listener::http::ConnectReplies,
		resolver::SystemResolver,
		router::ProxyRouter,
		ruleset::{AllowAll, DenyList},
	};

	fn dispatcher(ruleset: Arc<dyn Ruleset>) -> Dispatcher {
		Dispatcher::new(
			Arc::new(BasicAuthenticator::new(std::collections::HashMap::new())),
			Arc::new(ProxyRouter),
			Arc::new(SystemResolver),
			ruleset,
			vec![
				Connector::Stream(StreamConnector::new(DialOptions::default())),
				Connector::Hrtp(HrtpConnector::new(DialOptions::default())),
			],
		)
	}

	fn connection(destination: Option<Destination>, client: ClientChannel) -> Connection {
		Connection {
			id: ConnId::generate(),
			kind: ServerKind::Socks5,
			source: ([127, 0, 0, 1], 50000).into(),
			destination,
			identity: None,
			channel: client,
			replies: Box::new(ConnectReplies),
		}
	}

	fn context() -> DispatchContext {
		DispatchContext::new(
			ConnId::generate(),
			ServerKind::Socks5,
			CancellationToken::new().child_token(),
		)
	}

	#[tokio::test]
	async fn route_failure_short_circuits() {
		let dispatcher = dispatcher(Arc::new(AllowAll));
		let (client, _far) = duplex(64);
		let conn = connection(None, ClientChannel::Stream(Box::new(client)));

		let err = dispatcher.serve(&context(), conn).await.unwrap_err();

		assert!(matches!(err, DispatchError::Route(_)));
	}

	#[tokio::test]
	async fn ruleset_deny_writes_reply_without_dialing() {
		let dispatcher = dispatcher(Arc::new(DenyList::new(&["10.0.0.1:22".to_string()])));
		let (client, mut far) = duplex(256);
		let destination = Destination::new(Network::Tcp, "10.0.0.1:22".parse().unwrap());
		let conn = connection(Some(destination), ClientChannel::Stream(Box::new(client)));

		let err = dispatcher.serve(&context(), conn).await.unwrap_err();

		assert!(matches!(err, DispatchError::Denied));

		let mut reply = vec![0_u8; b"HTTP/1.1 403 Forbidden\r\n\r\n".len()];
		far.read_exact(&mut reply).await.unwrap();
		assert_eq!(&reply, b"HTTP/1.1 403 Forbidden\r\n\r\n");
	}

	#[tokio::test]
	async fn unsupported_network_is_reported() {
		let dispatcher = dispatcher(Arc::new(AllowAll));
		let (client, _far) = duplex(64);
		let destination = Destination::new(Network::Udp, "127.0.0.1:53".parse().unwrap());
		let conn = connection(Some(destination), ClientChannel::Stream(Box::new(client)));

		let err = dispatcher.serve(&context(), conn).await.unwrap_err();

		assert!(matches!(
			err,
			DispatchError::UnsupportedNetwork(Network::Udp)
		));
	}

	#[tokio::test]
	async fn pipeline_resolves_dials_and_relays() {
		// A one-shot upstream that echoes a single message back
		let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let upstream_port = upstream.local_addr().unwrap().port();

		tokio::spawn(async move {
			let (mut peer, _) = upstream.accept().await.unwrap();
			let mut buf = [0_u8; 4];
			peer.read_exact(&mut buf).await.unwrap();
			peer.write_all(b"pong").await.unwrap();
		});

		let dispatcher = dispatcher(Arc::new(AllowAll));
		let (client, mut far) = duplex(256);
		// A domain destination, so the resolver runs too
		let destination = Destination::new(
			Network::Tcp,
			Address::new(crate::addr::Host::Domain("localhost".to_string()), upstream_port),
		);
		let conn = connection(Some(destination), ClientChannel::Stream(Box::new(client)));

		let serve = tokio::spawn(async move {
			let dispatcher = dispatcher;
			dispatcher.serve(&context(), conn).await
		});

		// The success reply arrives before any tunneled bytes
		let mut reply = vec![0_u8; b"HTTP/1.1 200 Connection established\r\n\r\n".len()];
		far.read_exact(&mut reply).await.unwrap();
		assert_eq!(&reply, b"HTTP/1.1 200 Connection established\r\n\r\n");

		far.write_all(b"ping").await.unwrap();

		let mut echoed = [0_u8; 4];
		far.read_exact(&mut echoed).await.unwrap();
		assert_eq!(&echoed, b"pong");

		// Closing the client ends the tunnel
		drop(far);
		serve.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn forward_style_connection_uses_no_replies() {
		let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let target: Address = format!("127.0.0.1:{}", upstream.local_addr().unwrap().port())
			.parse()
			.unwrap();

		tokio::spawn(async move {
			let (mut peer, _) = upstream.accept().await.unwrap();
			peer.write_all(b"hi").await.unwrap();
		});

		let dispatcher = Dispatcher::new(
			Arc::new(BasicAuthenticator::new(std::collections::HashMap::new())),
			Arc::new(crate::router::StaticRouter::new(Destination::new(
				Network::Tcp,
				target,
			))),
			Arc::new(SystemResolver),
			Arc::new(AllowAll),
			vec![Connector::Stream(StreamConnector::new(
				DialOptions::default(),
			))],
		);

		let (client, mut far) = duplex(64);
		let conn = Connection {
			id: ConnId::generate(),
			kind: ServerKind::Tcp,
			source: ([127, 0, 0, 1], 50000).into(),
			destination: None,
			identity: None,
			channel: ClientChannel::Stream(Box::new(client)),
			replies: Box::new(NoReplies),
		};

		let serve = tokio::spawn(async move {
			let dispatcher = dispatcher;
			dispatcher
				.dispatch(
					DispatchContext::new(
						ConnId::generate(),
						ServerKind::Tcp,
						CancellationToken::new().child_token(),
					),
					conn,
				)
				.await;
		});

		// No reply bytes, just the forwarded stream
		let mut out = [0_u8; 2];
		far.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"hi");

		drop(far);
		serve.await.unwrap();
	}
}
