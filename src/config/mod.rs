//! Conduit server configuration handling
//!
//! The conduit server currently accepts the following configuration
//! options:
//!
//! - `mode` - What the server does. Possible values: `proxy` (HTTP/HTTPS/
//!   SOCKS5 proxying), `forward` (static TCP forwarding), `mixin` (both).
//!   **Default `proxy`**.
//! - `bind` - The IP address listeners bind to when `allow_lan` is enabled.
//!   **Default `0.0.0.0`**.
//! - `allow_lan` - Whether to accept connections from other hosts. When
//!   disabled, listeners bind to `127.0.0.1` regardless of `bind`.
//!   **Default `false`**.
//! - `http_port`, `https_port`, `socks_port` - Ports for the proxy-mode
//!   listeners; `0` disables a listener. **Default `0`**.
//! - `https.tls_cert_file`, `https.tls_key_file` - PEM certificate chain and
//!   private key for the HTTPS listener. Required (with paths of at least 3
//!   characters) when `https_port` is set.
//! - `auth.enabled` - Whether proxy listeners require authentication.
//!   **Default `false`**.
//! - `auth.basic` - A username → password map used when `auth.enabled` is
//!   set. Must be non-empty in that case.
//! - `deny` - A list of `host:port` destinations to refuse (port `0`
//!   matches any port). **Default empty**.
//! - `forward` - A list of forwarding rules (`{ port, destination }`,
//!   optionally `network` and `disabled`) used in `forward`/`mixin` modes.
//!   **Default empty**.
//! - `log_level` - Tracing log level. Possible values: `trace`, `debug`,
//!   `info`, `warn`, `error`. **Default `info`**.
//! - `log_format` - Log output format, `text` or `json`. **Default `text`**.

mod global;
mod partial;

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use tracing::Level;

pub use self::{
	global::Config,
	partial::{IntoPartialError, Partial},
};
use crate::addr::{Address, Network};

/// What the server does: proxying, static forwarding, or both at once.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Mode {
	/// Run the HTTP/HTTPS/SOCKS5 proxy listeners
	#[default]
	Proxy,
	/// Run only the configured forwarding rules
	Forward,
	/// Run proxy listeners and forwarding rules together
	Mixin,
}

/// One static forwarding rule: accept on `port`, relay to `destination`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
	/// An optional human-readable description, used in logs
	#[serde(default)]
	pub description: Option<String>,
	/// The transport to forward. Only `tcp` rules are currently served.
	#[serde(default = "default_forward_network")]
	pub network: Network,
	/// The local port to accept on
	pub port: u16,
	/// The fixed destination to relay to
	pub destination: Address,
	/// Whether the rule is turned off without being deleted
	#[serde(default)]
	pub disabled: bool,
}

const fn default_forward_network() -> Network {
	Network::Tcp
}

impl Display for ForwardRule {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match &self.description {
			Some(description) => fmt.write_str(description),
			None => fmt.write_fmt(format_args!(
				"forward-{}-to-{}",
				self.port, self.destination
			)),
		}
	}
}

/// Authentication options for the proxy listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOptions {
	/// Whether listeners require clients to authenticate
	#[serde(default)]
	pub enabled: bool,
	/// Username → password map for basic authentication
	#[serde(default)]
	pub basic: std::collections::HashMap<String, String>,
}

/// TLS material for the HTTPS listener.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpsOptions {
	/// The file path of the certificate chain file (PEM format)
	#[serde(default)]
	pub tls_cert_file: String,
	/// The file path of the private key file (PEM format)
	#[serde(default)]
	pub tls_key_file: String,
}

/// Log level, corresponding to `tracing`'s levels.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogLevel {
	/// Lowest log level. Log everything, including very verbose debug/trace
	/// info. May expose private/secret information in logs.
	Trace,
	/// Log most things, including more verbose debug info. May expose
	/// private/secret information in logs.
	Debug,
	/// Recommended log level. Logs general information, warnings, and
	/// errors.
	#[default]
	Info,
	/// Log only warnings and errors. Generally not recommended, as this
	/// hides a lot of useful information from logs.
	Warn,
	/// Log only critical errors. Generally not recommended, as this hides a
	/// lot of useful information from logs.
	Error,
}

impl From<LogLevel> for Level {
	fn from(log_level: LogLevel) -> Self {
		match log_level {
			LogLevel::Trace => Level::TRACE,
			LogLevel::Debug => Level::DEBUG,
			LogLevel::Info => Level::INFO,
			LogLevel::Warn => Level::WARN,
			LogLevel::Error => Level::ERROR,
		}
	}
}

/// Log output format.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
	/// Human-readable single-line output
	#[default]
	Text,
	/// One JSON object per event
	Json,
}
