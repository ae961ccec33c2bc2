//! Client authentication for proxy listeners.
//!
//! Listeners collect credentials during their protocol handshake (the
//! `Proxy-Authorization` header for HTTP, the username/password
//! sub-negotiation for SOCKS5) into an [`Authentication`] value, and hand it
//! to the dispatcher, which consults the configured [`Authenticator`]. The
//! listener is responsible for turning the result into the protocol-level
//! reply (`401`, SOCKS5 status byte, ...).

use std::{collections::HashMap, fmt::Debug, net::SocketAddr};

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use strum::Display as EnumDisplay;
use thiserror::Error;

/// The error returned by an [`Authenticator`] when a credential is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
	/// The credential is malformed for its kind (e.g. a basic credential
	/// without a username or password)
	#[error("invalid username or password")]
	InvalidCredentials,
	/// The credential is well-formed but wrong
	#[error("authentication failed")]
	Failed,
	/// The credential kind is not supported by this authenticator
	#[error("unsupported credential kind: {0}")]
	UnsupportedKind(CredentialKind),
}

/// The kind of credential carried by an [`Authentication`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum CredentialKind {
	/// `username:password`
	Basic,
	/// An opaque bearer token
	Bearer,
	/// A whole, scheme-less header value treated as an opaque token
	Token,
	/// No credential was presented
	None,
}

/// A credential presented by a client during a listener handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Authentication {
	/// The address the client connected from
	pub source: SocketAddr,
	/// The kind of credential in `credential`
	pub kind: CredentialKind,
	/// The credential material; `user:pass` for [`CredentialKind::Basic`],
	/// the raw token otherwise
	pub credential: String,
}

impl Authentication {
	/// An [`Authentication`] for a client that presented no credential
	#[must_use]
	pub const fn none(source: SocketAddr) -> Self {
		Self {
			source,
			kind: CredentialKind::None,
			credential: String::new(),
		}
	}

	/// A basic (username/password) [`Authentication`]
	#[must_use]
	pub fn basic(source: SocketAddr, username: &str, password: &str) -> Self {
		Self {
			source,
			kind: CredentialKind::Basic,
			credential: format!("{username}:{password}"),
		}
	}
}

impl Debug for Authentication {
	/// Formats the authentication without exposing the credential material
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Authentication")
			.field("source", &self.source)
			.field("kind", &self.kind)
			.field("credential", &"...")
			.finish()
	}
}

/// Strip `prefix` from the start of `value`, ASCII-case-insensitively
fn strip_scheme<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
	match value.get(..prefix.len()) {
		Some(start) if start.eq_ignore_ascii_case(prefix) => value.get(prefix.len()..),
		_ => None,
	}
}

/// Parse a `Proxy-Authorization` header value into an [`Authentication`].
///
/// `Basic` credentials (matched ASCII-case-insensitively) are base64-decoded
/// into `user:pass` material; an undecodable value yields an empty credential
/// that the authenticator will reject. `Bearer` credentials keep the token
/// after the scheme. Anything else is kept whole as an opaque token, and an
/// absent header yields [`CredentialKind::None`].
#[must_use]
pub fn parse_proxy_authorization(value: Option<&str>, source: SocketAddr) -> Authentication {
	let Some(value) = value else {
		return Authentication::none(source);
	};

	if let Some(encoded) = strip_scheme(value, "Basic ") {
		let credential = BASE64_STANDARD
			.decode(encoded)
			.ok()
			.and_then(|decoded| String::from_utf8(decoded).ok())
			.unwrap_or_default();

		Authentication {
			source,
			kind: CredentialKind::Basic,
			credential,
		}
	} else if let Some(token) = strip_scheme(value, "Bearer ") {
		Authentication {
			source,
			kind: CredentialKind::Bearer,
			credential: token.to_string(),
		}
	} else {
		Authentication {
			source,
			kind: CredentialKind::Token,
			credential: value.to_string(),
		}
	}
}

/// The credential validation seam used by the dispatcher.
#[async_trait]
pub trait Authenticator: Debug + Send + Sync {
	/// Validate a credential collected by a listener.
	///
	/// # Errors
	/// Returns an [`AuthError`] describing why the credential was rejected.
	/// The caller decides how that maps onto its wire protocol.
	async fn authenticate(&self, auth: &Authentication) -> Result<(), AuthError>;
}

/// An [`Authenticator`] over a static username → password map.
pub struct BasicAuthenticator {
	users: HashMap<String, String>,
}

impl BasicAuthenticator {
	/// Create a new authenticator from a username → password map
	#[must_use]
	pub fn new(users: HashMap<String, String>) -> Self {
		Self { users }
	}

	/// The number of configured users
	#[must_use]
	pub fn user_count(&self) -> usize {
		self.users.len()
	}
}

impl Debug for BasicAuthenticator {
	/// Formats the authenticator without exposing any passwords
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("BasicAuthenticator")
			.field("users", &self.users.len())
			.finish()
	}
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
	async fn authenticate(&self, auth: &Authentication) -> Result<(), AuthError> {
		if auth.kind != CredentialKind::Basic {
			return Err(AuthError::UnsupportedKind(auth.kind));
		}

		let (username, password) = auth
			.credential
			.split_once(':')
			.ok_or(AuthError::InvalidCredentials)?;

		if username.is_empty() || password.is_empty() {
			return Err(AuthError::InvalidCredentials);
		}

		if self.users.get(username).map(String::as_str) == Some(password) {
			Ok(())
		} else {
			Err(AuthError::Failed)
		}
	}
}
