//! Access control over dispatched connections.
//!
//! After routing and resolution, the dispatcher asks the configured
//! [`Ruleset`] whether the (source, identity, destination) triple is allowed
//! to proceed. A ruleset that has no opinion returns
//! [`RulesetError::NoMatch`], which the dispatcher treats as "allow" —
//! only an explicit [`RulesetError::Denied`] stops the connection.

use std::{fmt::Debug, net::SocketAddr};

use async_trait::async_trait;
use thiserror::Error;

use crate::addr::{Destination, Host};

/// The decision returned by a [`Ruleset`] when it does not allow a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesetError {
	/// No rule matched the connection; policy is silent, which the caller
	/// must treat as "allow"
	#[error("no ruleset matched")]
	NoMatch,
	/// A rule explicitly denied the connection
	#[error("denied by ruleset")]
	Denied,
}

/// Everything a [`Ruleset`] may base its decision on.
#[derive(Debug, Clone)]
pub struct RuleQuery<'a> {
	/// The address the client connected from
	pub source: SocketAddr,
	/// The authenticated identity (username), if any
	pub identity: Option<&'a str>,
	/// The routed (and, for domains, resolved) destination
	pub destination: &'a Destination,
}

/// The access-control seam consulted by the dispatcher once per connection.
#[async_trait]
pub trait Ruleset: Debug + Send + Sync {
	/// Decide whether the connection described by `query` may proceed.
	///
	/// # Errors
	/// [`RulesetError::NoMatch`] when no rule applies (the connection
	/// proceeds), [`RulesetError::Denied`] to stop it.
	async fn authorize(&self, query: &RuleQuery<'_>) -> Result<(), RulesetError>;
}

/// A [`Ruleset`] with no rules at all; every query reports
/// [`RulesetError::NoMatch`].
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Ruleset for AllowAll {
	async fn authorize(&self, _query: &RuleQuery<'_>) -> Result<(), RulesetError> {
		Err(RulesetError::NoMatch)
	}
}

/// A [`Ruleset`] denying destinations on a configured list.
///
/// Each entry is `host:port`, where the host matches an IP literal or domain
/// exactly and the port `0` matches any port.
#[derive(Debug, Default)]
pub struct DenyList {
	entries: Vec<(String, u16)>,
}

impl DenyList {
	/// Create a deny list from `host:port` entries. Entries that do not
	/// parse as `host:port` are kept as whole-host matches on any port.
	#[must_use]
	pub fn new(entries: &[String]) -> Self {
		Self {
			entries: entries
				.iter()
				.map(|entry| match entry.rsplit_once(':') {
					Some((host, port)) => match port.parse() {
						Ok(port) => (host.to_string(), port),
						Err(_) => (entry.clone(), 0),
					},
					None => (entry.clone(), 0),
				})
				.collect(),
		}
	}

	fn matches(&self, destination: &Destination) -> bool {
		let host = match &destination.address.host {
			Host::Ip(ip) => ip.to_string(),
			Host::Domain(domain) => domain.clone(),
		};

		self.entries.iter().any(|(deny_host, deny_port)| {
			deny_host == &host && (*deny_port == 0 || *deny_port == destination.address.port)
		})
	}
}

#[async_trait]
impl Ruleset for DenyList {
	async fn authorize(&self, query: &RuleQuery<'_>) -> Result<(), RulesetError> {
		if self.matches(query.destination) {
			Err(RulesetError::Denied)
		} else {
			Err(RulesetError::NoMatch)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::Network;

	fn query(destination: &Destination) -> RuleQuery<'_> {
		RuleQuery {
			source: ([127, 0, 0, 1], 50000).into(),
			identity: None,
			destination,
		}
	}

	fn dest(addr: &str) -> Destination {
		Destination::new(Network::Tcp, addr.parse().unwrap())
	}

	#[tokio::test]
	async fn allow_all_never_matches() {
		let destination = dest("10.0.0.1:22");

		assert_eq!(
			AllowAll.authorize(&query(&destination)).await,
			Err(RulesetError::NoMatch)
		);
	}

	#[tokio::test]
	async fn deny_list_exact() {
		let ruleset = DenyList::new(&["10.0.0.1:22".to_string()]);

		assert_eq!(
			ruleset.authorize(&query(&dest("10.0.0.1:22"))).await,
			Err(RulesetError::Denied)
		);
		assert_eq!(
			ruleset.authorize(&query(&dest("10.0.0.1:80"))).await,
			Err(RulesetError::NoMatch)
		);
		assert_eq!(
			ruleset.authorize(&query(&dest("10.0.0.2:22"))).await,
			Err(RulesetError::NoMatch)
		);
	}

	#[tokio::test]
	async fn deny_list_any_port() {
		let ruleset = DenyList::new(&["internal.example:0".to_string()]);

		assert_eq!(
			ruleset
				.authorize(&query(&dest("internal.example:4433")))
				.await,
			Err(RulesetError::Denied)
		);
	}
}
