//! # conduit server
//!
//! The conduit server binary: parses the command line, sets up logging per
//! the configured level and format, assembles the configured
//! [`Instance`], and runs it until ctrl-c.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use conduit::{
	config::{Config, LogFormat},
	instance::Instance,
	util::{SERVER_HELP, SERVER_NAME},
};
use pico_args::Arguments;
use tokio::runtime::Builder;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<(), anyhow::Error> {
	// Create a temporary tracing subscriber to collect and show logs on
	// startup
	let tracing_subscriber = FmtSubscriber::builder()
		.with_level(true)
		.with_max_level(if cfg!(debug_assertions) {
			Level::DEBUG
		} else {
			Level::INFO
		})
		.finish();

	// Set the subscriber as the current default so logs are sent there
	let subscriber_guard = tracing::subscriber::set_default(tracing_subscriber);

	info!(server = SERVER_NAME, "Starting conduit");

	// Parse cli args
	let mut args = Arguments::from_env();

	if args.contains(["-h", "--help"]) {
		println!("{SERVER_HELP}");
		return Ok(());
	}

	info!("Getting server configuration");

	// Configure the server
	let config = Config::new_static(args.opt_value_from_str(["-c", "--config"])?);

	debug!(%config, "Server configuration parsed");

	// Create the permanent global tracing subscriber to collect and show
	// logs, honoring the configured level and format
	let (non_blocking, _tracing_appender_guard) = tracing_appender::non_blocking(std::io::stdout());
	let level = Level::from(config.log_level());

	drop(subscriber_guard);

	match config.log_format() {
		LogFormat::Text => {
			let tracing_subscriber = FmtSubscriber::builder()
				.with_level(true)
				.with_max_level(level)
				.with_writer(non_blocking)
				.finish();

			tracing::subscriber::set_global_default(tracing_subscriber)
				.expect("setting tracing default subscriber failed");
		}
		LogFormat::Json => {
			let tracing_subscriber = FmtSubscriber::builder()
				.with_level(true)
				.with_max_level(level)
				.with_writer(non_blocking)
				.json()
				.finish();

			tracing::subscriber::set_global_default(tracing_subscriber)
				.expect("setting tracing default subscriber failed");
		}
	}

	// Start tokio async runtime
	let rt = Builder::new_multi_thread()
		.enable_all()
		.thread_name_fn(|| {
			static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
			let id = ATOMIC_ID.fetch_add(1, Ordering::Relaxed);
			format!("conduit-worker-{id:#04x}")
		})
		.build()
		.expect("async runtime initialization");

	// Wire the configured mode; socket binding happens here, so failures
	// surface before the server reports itself as started
	let instance = rt.block_on(async { Instance::new(config) })?;
	let shutdown = instance.shutdown_handle();

	info!(%config, "Conduit server started");

	rt.block_on(async move {
		let mut server = tokio::spawn(instance.run());

		tokio::select! {
			signal = tokio::signal::ctrl_c() => {
				match signal {
					Ok(()) => info!("Shutdown requested"),
					Err(err) => error!(?err, "Error waiting for the shutdown signal"),
				}

				shutdown.cancel();
				server.await?.map_err(anyhow::Error::from)
			}
			finished = &mut server => {
				finished??;
				Err(anyhow!("the server stopped unexpectedly"))
			}
		}
	})?;

	info!("Conduit server stopped");

	Ok(())
}
