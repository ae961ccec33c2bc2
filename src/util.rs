//! Miscellaneous statics and utilities used throughout conduit.

/// A string representation of this crate's version. In debug builds, this
/// is in the form of `[full semver crate version]+debug`. In release
/// builds this gets shortened to `MAJOR.MINOR`.
pub const VERSION: &str = if cfg!(debug_assertions) {
	concat!(env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// The name of the server implemented by this crate, used in logs on
/// startup. Currently this is `conduit/[version]`, where the version is
/// `util::VERSION`.
pub const SERVER_NAME: &str = if cfg!(debug_assertions) {
	concat!("conduit/", env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		"conduit/",
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// Help string for server CLI
pub const SERVER_HELP: &str = r#"conduit server

USAGE:
    server [FLAGS] [OPTIONS] [CONFIGURATION]

EXAMPLE:
    server -c ./config.toml --mode proxy --socks-port 1080

FLAGS:
 -h --help                   Print this and exit

OPTIONS:
 -c --config PATH            Configuration file path. Supported formats: toml (*.toml), yaml/json (*.yaml, *.yml, *.json)

CONFIGURATION:
    --[OPTION] VALUE         Configuration option (in "kebab-case"), see documentation for possible options and values

The FLAGS and OPTIONS above are separate from configuration options, because they influence server behaviour on startup only, and can only be specified on the command-line.
Configuration options are parsed first from environment variables ("CONDUIT_[CONFIG_OPTION]"), then from the configuration file, then from command-line arguments ("--[config-option]"), later ones overwriting earlier ones.
This means that command-line options overwrite everything, config file options overwrite default values and environment variables, environment variables overwrite only defaults, and the default value is used only when an option is not specified anywhere.
"#;
