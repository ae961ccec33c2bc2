//! Global conduit server configuration.

use std::{
	collections::HashMap,
	fmt::{Display, Formatter, Result as FmtResult},
	net::{IpAddr, Ipv4Addr},
	path::PathBuf,
};

use parking_lot::RwLock;
use tracing::warn;

use crate::config::{
	partial::Partial, AuthOptions, ForwardRule, HttpsOptions, LogFormat, LogLevel, Mode,
};

/// Global configuration for the conduit server. This is the more idiomatic,
/// easier to use (in rust code), and shareable-across-threads version,
/// which is assembled from [`Partial`]s.
#[derive(Debug)]
pub struct Config {
	inner: RwLock<ConfigInner>,
	file: Option<PathBuf>,
}

impl Config {
	/// Create a new `Config` instance using the provided file path as the
	/// configuration file. Configuration data is parsed from environment
	/// variables, the config file, and command-line arguments, in that
	/// order. If there is an error with the configuration file or any other
	/// configuration source, no error is emitted. Instead, a warning is
	/// logged, and the other configuration sources are used.
	///
	/// # IO
	/// This function performs synchronous file IO, and should therefore not
	/// be used inside of an asynchronous context.
	#[must_use]
	pub fn new(file: Option<PathBuf>) -> Self {
		let config = Self {
			inner: RwLock::new(ConfigInner::default()),
			file,
		};
		config.update();
		config
	}

	/// Create a new static reference to a new `Config` instance using the
	/// provided file path as the configuration file.
	///
	/// # Memory
	/// Because this function leaks memory with no (safe) way of freeing it,
	/// care should be taken not to call this function an unbounded number
	/// of times.
	///
	/// # IO
	/// This function performs synchronous file IO, and should therefore not
	/// be used inside of an asynchronous context.
	#[must_use]
	pub fn new_static(file: Option<PathBuf>) -> &'static Self {
		Box::leak(Box::new(Self::new(file)))
	}

	/// Update this config from environment variables, config file, and
	/// command-line arguments. This function starts with defaults for each
	/// option, then updates those from environment variables, then from the
	/// config file, then from command-line arguments, and finally
	/// overwrites this `Config`'s options with those newly-parsed ones.
	///
	/// # IO
	/// This function performs synchronous file IO, and should therefore not
	/// be used inside of an asynchronous context.
	pub fn update(&self) {
		let mut config = ConfigInner::default();

		config.update_from_partial(&Partial::from_env_vars());

		if let Some(ref file) = *self.file() {
			match Partial::from_file(file) {
				Ok(partial) => config.update_from_partial(&partial),
				Err(err) => warn!("Could not read configuration from file: {err}"),
			}
		}

		config.update_from_partial(&Partial::from_args());

		*self.inner.write() = config;
	}

	/// Replace this config's options from a single [`Partial`], on top of
	/// defaults. Intended for programmatic setup (e.g. tests) where
	/// process-wide sources would interfere.
	pub fn set_from_partial(&self, partial: &Partial) {
		let mut config = ConfigInner::default();
		config.update_from_partial(partial);
		*self.inner.write() = config;
	}

	/// Get the server mode
	#[must_use]
	pub fn mode(&self) -> Mode {
		self.inner.read().mode
	}

	/// Get the address listeners bind to, with `allow_lan` applied:
	/// loopback when LAN access is disabled, the configured `bind` address
	/// otherwise
	#[must_use]
	pub fn bind_addr(&self) -> IpAddr {
		let inner = self.inner.read();

		if inner.allow_lan {
			inner.bind
		} else {
			IpAddr::V4(Ipv4Addr::LOCALHOST)
		}
	}

	/// Get the raw `bind` configuration option
	#[must_use]
	pub fn bind(&self) -> IpAddr {
		self.inner.read().bind
	}

	/// Get the `allow_lan` configuration option
	#[must_use]
	pub fn allow_lan(&self) -> bool {
		self.inner.read().allow_lan
	}

	/// Get the HTTP proxy listener port (`0` = disabled)
	#[must_use]
	pub fn http_port(&self) -> u16 {
		self.inner.read().http_port
	}

	/// Get the HTTPS proxy listener port (`0` = disabled)
	#[must_use]
	pub fn https_port(&self) -> u16 {
		self.inner.read().https_port
	}

	/// Get the SOCKS5 proxy listener port (`0` = disabled)
	#[must_use]
	pub fn socks_port(&self) -> u16 {
		self.inner.read().socks_port
	}

	/// Get the TLS options for the HTTPS listener
	#[must_use]
	pub fn https(&self) -> HttpsOptions {
		self.inner.read().https.clone()
	}

	/// Get the listener authentication options
	#[must_use]
	pub fn auth(&self) -> AuthOptions {
		self.inner.read().auth.clone()
	}

	/// Get the destination deny list
	#[must_use]
	pub fn deny(&self) -> Vec<String> {
		self.inner.read().deny.clone()
	}

	/// Get the static forwarding rules
	#[must_use]
	pub fn forward(&self) -> Vec<ForwardRule> {
		self.inner.read().forward.clone()
	}

	/// Get the configured log level
	#[must_use]
	pub fn log_level(&self) -> LogLevel {
		self.inner.read().log_level
	}

	/// Get the configured log format
	#[must_use]
	pub fn log_format(&self) -> LogFormat {
		self.inner.read().log_format
	}

	/// Get the configuration file path
	#[must_use]
	pub const fn file(&self) -> &Option<PathBuf> {
		&self.file
	}
}

impl Display for Config {
	/// Formats the configuration with passwords redacted
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		let auth = self.auth();
		let users: HashMap<&str, &str> = auth
			.basic
			.keys()
			.map(|user| (user.as_str(), "..."))
			.collect();

		fmt.debug_struct("Config")
			.field("mode", &self.mode().to_string())
			.field("bind", &self.bind())
			.field("allow_lan", &self.allow_lan())
			.field("http_port", &self.http_port())
			.field("https_port", &self.https_port())
			.field("socks_port", &self.socks_port())
			.field("https", &self.https())
			.field("auth_enabled", &auth.enabled)
			.field("auth_basic", &users)
			.field("deny", &self.deny())
			.field("forward", &self.forward())
			.field("log_level", &self.log_level().to_string())
			.field("log_format", &self.log_format().to_string())
			.field("file", &self.file())
			.finish()
	}
}

/// Actual configuration storage inside of a [`Config`]
#[derive(Debug, PartialEq)]
struct ConfigInner {
	/// What the server does
	pub mode: Mode,
	/// Address listeners bind to when `allow_lan` is enabled
	pub bind: IpAddr,
	/// Whether to accept connections from other hosts
	pub allow_lan: bool,
	/// HTTP proxy listener port, `0` = disabled
	pub http_port: u16,
	/// HTTPS proxy listener port, `0` = disabled
	pub https_port: u16,
	/// SOCKS5 proxy listener port, `0` = disabled
	pub socks_port: u16,
	/// TLS material for the HTTPS listener
	pub https: HttpsOptions,
	/// Listener authentication options
	pub auth: AuthOptions,
	/// Destinations to refuse
	pub deny: Vec<String>,
	/// Static forwarding rules
	pub forward: Vec<ForwardRule>,
	/// Minimum level of logs to be collected/displayed
	pub log_level: LogLevel,
	/// Log output format
	pub log_format: LogFormat,
}

impl ConfigInner {
	/// Update the config from a [`Partial`]. This overwrites all fields of
	/// this config from the provided [`Partial`], if they are set in that
	/// partial config.
	fn update_from_partial(&mut self, partial: &Partial) {
		if let Some(mode) = partial.mode {
			self.mode = mode;
		}

		if let Some(bind) = partial.bind {
			self.bind = bind;
		}

		if let Some(allow_lan) = partial.allow_lan {
			self.allow_lan = allow_lan;
		}

		if let Some(http_port) = partial.http_port {
			self.http_port = http_port;
		}

		if let Some(https_port) = partial.https_port {
			self.https_port = https_port;
		}

		if let Some(socks_port) = partial.socks_port {
			self.socks_port = socks_port;
		}

		if let Some(ref https) = partial.https {
			self.https = https.clone();
		}

		if let Some(ref auth) = partial.auth {
			self.auth = auth.clone();
		}

		if let Some(ref deny) = partial.deny {
			self.deny = deny.clone();
		}

		if let Some(ref forward) = partial.forward {
			self.forward = forward.clone();
		}

		if let Some(log_level) = partial.log_level {
			self.log_level = log_level;
		}

		if let Some(log_format) = partial.log_format {
			self.log_format = log_format;
		}
	}
}

impl Default for ConfigInner {
	fn default() -> Self {
		Self {
			mode: Mode::default(),
			bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			allow_lan: false,
			http_port: 0,
			https_port: 0,
			socks_port: 0,
			https: HttpsOptions::default(),
			auth: AuthOptions::default(),
			deny: Vec::new(),
			forward: Vec::new(),
			log_level: LogLevel::default(),
			log_format: LogFormat::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_inner_update_from_partial() {
		let mut inner = ConfigInner::default();
		let empty = Partial::default();

		inner.update_from_partial(&empty);
		assert_eq!(inner, ConfigInner::default());

		let partial = Partial {
			mode: Some(Mode::Mixin),
			socks_port: Some(1080),
			allow_lan: Some(true),
			..Partial::default()
		};

		inner.update_from_partial(&partial);
		assert_eq!(inner.mode, Mode::Mixin);
		assert_eq!(inner.socks_port, 1080);
		assert!(inner.allow_lan);
		// Untouched options keep their defaults
		assert_eq!(inner.http_port, 0);
	}

	#[test]
	fn bind_addr_honors_allow_lan() {
		let config = Config {
			inner: RwLock::new(ConfigInner::default()),
			file: None,
		};

		config.set_from_partial(&Partial {
			bind: Some("192.0.2.7".parse().unwrap()),
			allow_lan: Some(false),
			..Partial::default()
		});
		assert_eq!(config.bind_addr(), IpAddr::V4(Ipv4Addr::LOCALHOST));

		config.set_from_partial(&Partial {
			bind: Some("192.0.2.7".parse().unwrap()),
			allow_lan: Some(true),
			..Partial::default()
		});
		assert_eq!(config.bind_addr(), "192.0.2.7".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn display_redacts_passwords() {
		let config = Config {
			inner: RwLock::new(ConfigInner::default()),
			file: None,
		};

		config.set_from_partial(&Partial {
			auth: Some(AuthOptions {
				enabled: true,
				basic: std::collections::HashMap::from([(
					"user".to_string(),
					"hunter2".to_string(),
				)]),
			}),
			..Partial::default()
		});

		let shown = config.to_string();

		assert!(shown.contains("user"));
		assert!(!shown.contains("hunter2"));
	}
}
