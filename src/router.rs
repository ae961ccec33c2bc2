//! Routing of incoming connections to upstream destinations.
//!
//! A [`Router`] decides where a connection should go. Proxy-type servers
//! trust the destination the listener parsed out of the client's request;
//! forward-mode servers ignore it and substitute a configured target. The
//! router never mutates its input — the dispatcher pairs its result with the
//! connection in a [`Routed`].

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::{addr::Destination, conn::Connection};

/// The error returned when a connection can not be routed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
	/// The listener did not provide a destination, but this router requires
	/// one
	#[error("the connection carries no destination")]
	MissingDestination,
	/// The destination provided by the listener is not dialable
	#[error("the requested destination \"{0}\" is invalid")]
	InvalidDestination(String),
}

/// The routing seam consulted by the dispatcher once per connection.
#[async_trait]
pub trait Router: Debug + Send + Sync {
	/// Produce the destination the connection should be dialed to.
	///
	/// # Errors
	/// Returns a [`RouteError`] if no valid destination can be produced.
	async fn route(&self, conn: &Connection) -> Result<Destination, RouteError>;
}

/// A connection paired with its routed destination. After resolution the
/// destination address is always an IP literal.
#[derive(Debug)]
pub struct Routed {
	/// The destination produced by the router (and later narrowed by the
	/// resolver)
	pub destination: Destination,
	/// The connection being dispatched
	pub conn: Connection,
}

/// A [`Router`] that ignores the requested destination and always yields a
/// configured target. Used by forward-mode servers.
#[derive(Debug)]
pub struct StaticRouter {
	target: Destination,
}

impl StaticRouter {
	/// Create a router that sends every connection to `target`
	#[must_use]
	pub const fn new(target: Destination) -> Self {
		Self { target }
	}
}

#[async_trait]
impl Router for StaticRouter {
	async fn route(&self, _conn: &Connection) -> Result<Destination, RouteError> {
		Ok(self.target.clone())
	}
}

/// A [`Router`] that trusts the destination the listener parsed from the
/// client's request. Used by the HTTP, HTTPS, and SOCKS5 servers.
#[derive(Debug, Default)]
pub struct ProxyRouter;

#[async_trait]
impl Router for ProxyRouter {
	async fn route(&self, conn: &Connection) -> Result<Destination, RouteError> {
		let destination = conn
			.destination
			.as_ref()
			.ok_or(RouteError::MissingDestination)?;

		if !destination.is_valid() {
			return Err(RouteError::InvalidDestination(destination.to_string()));
		}

		Ok(destination.clone())
	}
}
