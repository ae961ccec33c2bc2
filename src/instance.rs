//! Wiring of a configured server mode into dispatchers and listeners.
//!
//! An [`Instance`] owns everything a running conduit server consists of:
//! per-protocol listeners, the dispatcher(s) behind them, and the root
//! cancellation token. Proxy-mode listeners share one dispatcher built
//! around the trust-the-client router; every forwarding rule gets its own
//! dispatcher around a static router for its destination.

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
	addr::{Destination, Network},
	auth::BasicAuthenticator,
	certs::load_server_config,
	config::{Config, Mode},
	connector::{Connector, DialOptions, HrtpConnector, StreamConnector},
	dispatch::Dispatcher,
	listener::{
		http::HttpListener, socks::SocksListener, tcp::ForwardListener, Listener, ListenerError,
		ListenerOptions,
	},
	resolver::SystemResolver,
	router::{ProxyRouter, StaticRouter},
	ruleset::{AllowAll, DenyList, Ruleset},
};

/// The error returned when a server instance can not be assembled
#[derive(Debug, Error)]
pub enum InitError {
	/// The configuration is unusable
	#[error("invalid configuration: {0}")]
	Config(String),
	/// A listener could not be created (bad port, bind failure, TLS
	/// material)
	#[error(transparent)]
	Listener(#[from] ListenerError),
}

/// A fully-wired conduit server, ready to run.
pub struct Instance {
	listeners: Vec<Box<dyn Listener>>,
	cancel: CancellationToken,
}

impl Instance {
	/// Assemble an instance from the configuration: validate the options,
	/// build the dispatchers, and bind every listener socket.
	///
	/// # Errors
	/// Returns an [`InitError`] for unusable configuration or any socket
	/// that can not be bound.
	pub fn new(config: &Config) -> Result<Self, InitError> {
		let mode = config.mode();
		let bind = config.bind_addr();
		let auth = config.auth();

		if auth.enabled && auth.basic.is_empty() {
			return Err(InitError::Config(
				"auth.enabled is set but auth.basic has no users".to_string(),
			));
		}

		if auth.enabled {
			info!(users = auth.basic.len(), "basic authentication enabled");
		}

		let ruleset = build_ruleset(config);
		let mut listeners: Vec<Box<dyn Listener>> = Vec::new();

		if matches!(mode, Mode::Proxy | Mode::Mixin) {
			let dispatcher = Arc::new(Dispatcher::new(
				Arc::new(BasicAuthenticator::new(auth.basic.clone())),
				Arc::new(ProxyRouter),
				Arc::new(SystemResolver),
				Arc::clone(&ruleset),
				vec![
					Connector::Stream(StreamConnector::new(DialOptions::default())),
					Connector::Hrtp(HrtpConnector::new(DialOptions::default())),
				],
			));

			if config.http_port() != 0 {
				let opts = ListenerOptions {
					bind,
					port: config.http_port(),
					auth: auth.enabled,
				};

				listeners.push(Box::new(HttpListener::new(opts, Arc::clone(&dispatcher))?));
			}

			if config.https_port() != 0 {
				let https = config.https();

				if https.tls_cert_file.len() < 3 {
					return Err(InitError::Config(
						"https.tls_cert_file is required in config".to_string(),
					));
				}

				if https.tls_key_file.len() < 3 {
					return Err(InitError::Config(
						"https.tls_key_file is required in config".to_string(),
					));
				}

				let tls = load_server_config(&https.tls_cert_file, &https.tls_key_file)
					.map_err(ListenerError::Tls)?;
				let opts = ListenerOptions {
					bind,
					port: config.https_port(),
					auth: auth.enabled,
				};

				listeners.push(Box::new(HttpListener::with_tls(
					opts,
					tls,
					Arc::clone(&dispatcher),
				)?));
			}

			if config.socks_port() != 0 {
				let opts = ListenerOptions {
					bind,
					port: config.socks_port(),
					auth: auth.enabled,
				};

				listeners.push(Box::new(SocksListener::new(opts, Arc::clone(&dispatcher))?));
			}
		}

		if matches!(mode, Mode::Forward | Mode::Mixin) {
			for rule in config.forward() {
				if rule.disabled {
					continue;
				}

				if rule.network != Network::Tcp {
					return Err(InitError::Config(format!(
						"forward rule \"{rule}\" uses unsupported network \"{}\"",
						rule.network
					)));
				}

				if !rule.destination.is_valid() {
					return Err(InitError::Config(format!(
						"forward rule \"{rule}\" has an invalid destination"
					)));
				}

				let dispatcher = Arc::new(Dispatcher::new(
					Arc::new(BasicAuthenticator::new(std::collections::HashMap::new())),
					Arc::new(StaticRouter::new(Destination::new(
						Network::Tcp,
						rule.destination.clone(),
					))),
					Arc::new(SystemResolver),
					Arc::clone(&ruleset),
					vec![Connector::Stream(StreamConnector::new(
						DialOptions::default(),
					))],
				));

				let opts = ListenerOptions {
					bind,
					port: rule.port,
					auth: false,
				};

				info!(rule = %rule, destination = %rule.destination, "forward rule enabled");
				listeners.push(Box::new(ForwardListener::new(opts, dispatcher)?));
			}
		}

		if listeners.is_empty() {
			return Err(InitError::Config(format!(
				"mode \"{mode}\" has no listeners configured"
			)));
		}

		Ok(Self {
			listeners,
			cancel: CancellationToken::new(),
		})
	}

	/// A handle to the root cancellation token. Cancelling it shuts the
	/// whole instance down, including all in-flight connections.
	#[must_use]
	pub fn shutdown_handle(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// The addresses the listeners are actually bound to, in wiring order
	#[must_use]
	pub fn listener_addrs(&self) -> Vec<SocketAddr> {
		self.listeners
			.iter()
			.map(|listener| listener.bound_addr())
			.collect()
	}

	/// Run all listeners until the instance is shut down via
	/// [`Self::shutdown_handle`].
	///
	/// # Errors
	/// Returns the first [`ListenerError`] if a listener fails; a clean
	/// shutdown returns `Ok(())`.
	pub async fn run(self) -> Result<(), ListenerError> {
		let mut handles = Vec::with_capacity(self.listeners.len());

		for listener in self.listeners {
			let cancel = self.cancel.clone();
			handles.push(spawn(async move { listener.listen(cancel).await }));
		}

		for handle in handles {
			match handle.await {
				Ok(result) => result?,
				Err(err) => warn!(?err, "listener task ended abnormally"),
			}
		}

		Ok(())
	}
}

/// Build the shared ruleset: a deny list when `deny` entries are
/// configured, otherwise no rules at all.
fn build_ruleset(config: &Config) -> Arc<dyn Ruleset> {
	let deny = config.deny();

	if deny.is_empty() {
		Arc::new(AllowAll)
	} else {
		Arc::new(DenyList::new(&deny))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AuthOptions, ForwardRule, Partial};

	#[test]
	fn auth_without_users_is_rejected() {
		let config = Config::new(None);
		config.set_from_partial(&Partial {
			socks_port: Some(0),
			auth: Some(AuthOptions {
				enabled: true,
				basic: std::collections::HashMap::new(),
			}),
			..Partial::default()
		});

		assert!(matches!(
			Instance::new(&config),
			Err(InitError::Config(_))
		));
	}

	#[test]
	fn no_listeners_is_rejected() {
		let config = Config::new(None);
		config.set_from_partial(&Partial::default());

		assert!(matches!(
			Instance::new(&config),
			Err(InitError::Config(_))
		));
	}

	#[tokio::test]
	async fn forward_rule_binds() {
		let config = Config::new(None);
		config.set_from_partial(&Partial {
			mode: Some(Mode::Forward),
			forward: Some(vec![ForwardRule {
				description: None,
				network: Network::Tcp,
				port: 0,
				destination: "127.0.0.1:80".parse().unwrap(),
				disabled: false,
			}]),
			..Partial::default()
		});

		// Port 0 is rejected by listener validation
		assert!(matches!(
			Instance::new(&config),
			Err(InitError::Listener(ListenerError::InvalidPort(0)))
		));
	}

	#[tokio::test]
	async fn disabled_forward_rules_are_skipped() {
		let config = Config::new(None);
		config.set_from_partial(&Partial {
			mode: Some(Mode::Forward),
			forward: Some(vec![ForwardRule {
				description: None,
				network: Network::Tcp,
				port: 39999,
				destination: "127.0.0.1:80".parse().unwrap(),
				disabled: true,
			}]),
			..Partial::default()
		});

		// The only rule is disabled, so there is nothing to run
		assert!(matches!(
			Instance::new(&config),
			Err(InitError::Config(_))
		));
	}
}
