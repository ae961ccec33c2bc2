//! Conduit server configuration as seen by the user

use std::{env, ffi::OsStr, fs, io::Error as IoError, net::IpAddr, path::Path, str::FromStr};

use basic_toml::Error as TomlError;
use pico_args::Arguments;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use serde_yaml::Error as YamlError;
use thiserror::Error;
use tracing::warn;

use crate::config::{AuthOptions, ForwardRule, HttpsOptions, LogFormat, LogLevel, Mode};

/// The error returned by fallible conversions into a [`Partial`]
#[derive(Debug, Error)]
pub enum IntoPartialError {
	/// Failed to parse from toml
	#[error("failed to parse from toml")]
	Toml(#[from] TomlError),
	/// Failed to parse from yaml
	#[error("failed to parse from yaml")]
	Yaml(#[from] YamlError),
	/// Failed to parse from json
	#[error("failed to parse from json")]
	Json(#[from] JsonError),
	/// Failed to read config file
	#[error("failed to read config file")]
	Io(#[from] IoError),
	/// File extension unknown, could not determine format
	#[error("file extension unknown, could not determine format")]
	UnknownExtension,
}

/// Parse the provided environment variable, returning `Some(...)` if it is
/// present, has a value, and was successfully parsed, and `None` otherwise
fn parse_env_var<T: FromStr>(key: &'static str) -> Option<T> {
	env::var(key).map_or(None, |s| s.parse().ok())
}

/// Parse the provided environment variable as a json value, returning
/// `Some(...)` on success and `None` (with a warning) otherwise
fn parse_env_json<T: serde::de::DeserializeOwned>(key: &'static str) -> Option<T> {
	env::var(key).map_or(None, |s| {
		serde_json::from_str(&s)
			.map_err(|err| {
				warn!(
					%err,
					"Error parsing configuration from environment variable '{key}'"
				);
			})
			.ok()
	})
}

/// Parse the provided command-line argument as a json value, returning
/// `Some(...)` on success and `None` (with a warning) otherwise
fn parse_arg_json<T: serde::de::DeserializeOwned>(args: &mut Arguments, key: &'static str) -> Option<T> {
	args.opt_value_from_fn(key, |s| serde_json::from_str(s))
		.map_err(|err| {
			warn!(
				%err,
				"Error parsing configuration from command-line argument '{key}'"
			);
		})
		.ok()
		.flatten()
}

/// Conduit configuration from one source only, as seen from the user's
/// perspective. All fields are optional, which allows incremental updates
/// to the actual [`Config`](crate::config::Config) struct.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partial {
	/// What the server does: `proxy`, `forward`, or `mixin`
	pub mode: Option<Mode>,
	/// The address listeners bind to when `allow_lan` is enabled
	pub bind: Option<IpAddr>,
	/// Whether to accept connections from other hosts
	pub allow_lan: Option<bool>,
	/// The HTTP proxy listener port, `0` to disable
	pub http_port: Option<u16>,
	/// The HTTPS proxy listener port, `0` to disable
	pub https_port: Option<u16>,
	/// The SOCKS5 proxy listener port, `0` to disable
	pub socks_port: Option<u16>,
	/// TLS material for the HTTPS listener
	pub https: Option<HttpsOptions>,
	/// Listener authentication options
	pub auth: Option<AuthOptions>,
	/// Destinations to refuse, as `host:port` entries
	pub deny: Option<Vec<String>>,
	/// Static forwarding rules
	pub forward: Option<Vec<ForwardRule>>,
	/// Minimum level of logs to be collected/displayed
	pub log_level: Option<LogLevel>,
	/// Log output format
	pub log_format: Option<LogFormat>,
}

impl Partial {
	/// Parse a [`Partial`] from a [toml](https://toml.io/en/) string
	///
	/// # Errors
	/// Returns an `IntoPartialError::Toml` if deserialization fails.
	pub fn from_toml(toml: &str) -> Result<Self, IntoPartialError> {
		Ok(basic_toml::from_str(toml)?)
	}

	/// Parse a [`Partial`] from a [yaml](https://yaml.org/) string
	///
	/// # Errors
	/// Returns an `IntoPartialError::Yaml` if deserialization fails.
	pub fn from_yaml(yaml: &str) -> Result<Self, IntoPartialError> {
		Ok(serde_yaml::from_str(yaml)?)
	}

	/// Parse a [`Partial`] from a [json](https://json.org/) string
	///
	/// # Errors
	/// Returns an `IntoPartialError::Json` if deserialization fails.
	pub fn from_json(json: &str) -> Result<Self, IntoPartialError> {
		Ok(serde_json::from_str(json)?)
	}

	/// Read and parse a configuration file into a [`Partial`]. The format
	/// of the file is determined from its extension:
	/// - `*.toml` files are parsed as [toml](https://toml.io/en/)
	/// - `*.yaml` and `*.yml` files are parsed as [yaml](https://yaml.org/)
	/// - `*.json` files are parsed as [json](https://json.org/)
	///
	/// # IO
	/// This function performs synchronous file IO, and should not be used
	/// in an asynchronous context.
	///
	/// # Errors
	/// Returns an error when reading or parsing the file fails.
	pub fn from_file(path: &Path) -> Result<Self, IntoPartialError> {
		let parse = match path.extension().map(OsStr::to_str) {
			Some(Some("toml")) => Self::from_toml,
			Some(Some("yaml" | "yml")) => Self::from_yaml,
			Some(Some("json")) => Self::from_json,
			_ => return Err(IntoPartialError::UnknownExtension),
		};

		parse(&fs::read_to_string(path)?)
	}

	/// Parse command-line arguments into a [`Partial`]. The `auth`, `deny`,
	/// `forward`, and `https` options are parsed from json strings.
	#[must_use]
	pub fn from_args() -> Self {
		let mut args = Arguments::from_env();

		Self {
			mode: args.opt_value_from_str("--mode").unwrap_or(None),
			bind: args.opt_value_from_str("--bind").unwrap_or(None),
			allow_lan: args.opt_value_from_str("--allow-lan").unwrap_or(None),
			http_port: args.opt_value_from_str("--http-port").unwrap_or(None),
			https_port: args.opt_value_from_str("--https-port").unwrap_or(None),
			socks_port: args.opt_value_from_str("--socks-port").unwrap_or(None),
			https: parse_arg_json(&mut args, "--https"),
			auth: parse_arg_json(&mut args, "--auth"),
			deny: parse_arg_json(&mut args, "--deny"),
			forward: parse_arg_json(&mut args, "--forward"),
			log_level: args.opt_value_from_str("--log-level").unwrap_or(None),
			log_format: args.opt_value_from_str("--log-format").unwrap_or(None),
		}
	}

	/// Parse environment variables with the prefix `CONDUIT_` into a
	/// [`Partial`]. The `auth`, `deny`, `forward`, and `https` options are
	/// parsed from json strings.
	#[must_use]
	pub fn from_env_vars() -> Self {
		Self {
			mode: parse_env_var("CONDUIT_MODE"),
			bind: parse_env_var("CONDUIT_BIND"),
			allow_lan: parse_env_var("CONDUIT_ALLOW_LAN"),
			http_port: parse_env_var("CONDUIT_HTTP_PORT"),
			https_port: parse_env_var("CONDUIT_HTTPS_PORT"),
			socks_port: parse_env_var("CONDUIT_SOCKS_PORT"),
			https: parse_env_json("CONDUIT_HTTPS"),
			auth: parse_env_json("CONDUIT_AUTH"),
			deny: parse_env_json("CONDUIT_DENY"),
			forward: parse_env_json("CONDUIT_FORWARD"),
			log_level: parse_env_var("CONDUIT_LOG_LEVEL"),
			log_format: parse_env_var("CONDUIT_LOG_FORMAT"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_toml() {
		let partial = Partial::from_toml(
			r#"
mode = "mixin"
allow_lan = true
http_port = 8080
socks_port = 1080
deny = ["10.0.0.1:22"]

[auth]
enabled = true

[auth.basic]
user = "pass"

[[forward]]
port = 9999
destination = "127.0.0.1:80"
"#,
		)
		.unwrap();

		assert_eq!(partial.mode, Some(Mode::Mixin));
		assert_eq!(partial.allow_lan, Some(true));
		assert_eq!(partial.http_port, Some(8080));
		assert_eq!(partial.socks_port, Some(1080));
		assert_eq!(partial.deny, Some(vec!["10.0.0.1:22".to_string()]));

		let auth = partial.auth.unwrap();
		assert!(auth.enabled);
		assert_eq!(auth.basic.get("user").map(String::as_str), Some("pass"));

		let forward = partial.forward.unwrap();
		assert_eq!(forward.len(), 1);
		assert_eq!(forward[0].port, 9999);
		assert_eq!(forward[0].destination, "127.0.0.1:80".parse().unwrap());
	}

	#[test]
	fn from_yaml() {
		let partial = Partial::from_yaml(
			r"
mode: proxy
https_port: 8443
https:
  tls_cert_file: ./cert.pem
  tls_key_file: ./key.pem
log_format: json
",
		)
		.unwrap();

		assert_eq!(partial.mode, Some(Mode::Proxy));
		assert_eq!(partial.https_port, Some(8443));
		assert_eq!(partial.log_format, Some(LogFormat::Json));

		let https = partial.https.unwrap();
		assert_eq!(https.tls_cert_file, "./cert.pem");
		assert_eq!(https.tls_key_file, "./key.pem");
	}

	#[test]
	fn from_json() {
		let partial =
			Partial::from_json(r#"{ "socks_port": 1080, "log_level": "debug" }"#).unwrap();

		assert_eq!(partial.socks_port, Some(1080));
		assert_eq!(partial.log_level, Some(LogLevel::Debug));
	}

	#[test]
	fn unknown_values_fail() {
		assert!(Partial::from_json(r#"{ "mode": "reverse" }"#).is_err());
		assert!(Partial::from_toml("log_format = \"xml\"").is_err());
	}
}
