//! Domain name resolution for routed destinations.
//!
//! The dispatch pipeline resolves a destination's domain into an IP address
//! before handing it to a connector, so connectors only ever dial IP
//! literals. The [`Resolver`] trait is the seam; the default implementation
//! uses the operating system's resolver.

use std::{fmt::Debug, io::Error as IoError, net::IpAddr, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{net::lookup_host, time::timeout};

/// How long a single resolution may take before it is abandoned
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// The error returned when a domain can not be resolved
#[derive(Debug, Error)]
pub enum ResolveError {
	/// The resolver returned no address for the domain
	#[error("no address found for \"{0}\"")]
	NotFound(String),
	/// The resolution did not complete in time
	#[error("resolving \"{0}\" timed out")]
	TimedOut(String),
	/// The underlying resolver failed
	#[error("resolver error")]
	Io(#[from] IoError),
}

/// The domain → IP resolution seam used by the dispatcher. Implementations
/// own their timeout behavior and must be safe to share across connections.
#[async_trait]
pub trait Resolver: Debug + Send + Sync {
	/// Resolve a domain name into a single IP address.
	///
	/// # Errors
	/// Returns a [`ResolveError`] if the domain does not resolve, the
	/// resolver fails, or the lookup times out.
	async fn resolve(&self, domain: &str) -> Result<IpAddr, ResolveError>;
}

/// A [`Resolver`] using the operating system's name resolution.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
	async fn resolve(&self, domain: &str) -> Result<IpAddr, ResolveError> {
		// The port is irrelevant, `lookup_host` requires one
		let addrs = timeout(RESOLVE_TIMEOUT, lookup_host((domain, 0)))
			.await
			.map_err(|_| ResolveError::TimedOut(domain.to_string()))??;

		addrs
			.map(|addr| addr.ip())
			.next()
			.ok_or_else(|| ResolveError::NotFound(domain.to_string()))
	}
}
