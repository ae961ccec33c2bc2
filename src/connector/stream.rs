//! The TCP tunneling connector.

use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
	conn::{ClientChannel, Replies as _},
	connector::{dial, ConnectError, DialOptions},
	router::Routed,
};

/// A connector that dials the destination over TCP and relays bytes in both
/// directions until either side finishes. Stateless across connections and
/// safe to share.
#[derive(Debug, Default)]
pub struct StreamConnector {
	opts: DialOptions,
}

impl StreamConnector {
	/// Create a stream connector with the provided dial options
	#[must_use]
	pub const fn new(opts: DialOptions) -> Self {
		Self { opts }
	}

	/// Dial the routed destination, fire the dialed reply, and relay until
	/// either direction completes. The sibling direction is cancelled when
	/// the first one returns, and the upstream socket is closed on every
	/// exit path.
	///
	/// # Errors
	/// Returns a [`ConnectError`] for dial failures, reply-write failures,
	/// and relay errors (including idle-timeout teardown).
	pub async fn dial_serve(
		&self,
		cancel: &CancellationToken,
		routed: &mut Routed,
	) -> Result<(), ConnectError> {
		let dialed = match cancel
			.run_until_cancelled(dial(&routed.destination.address, &self.opts))
			.await
		{
			Some(dialed) => dialed,
			None => return Err(ConnectError::Relay(IoError::from(ErrorKind::Interrupted))),
		};

		let mut upstream = match dialed {
			Ok(upstream) => upstream,
			Err(err) => {
				routed
					.conn
					.replies
					.after_dial(routed.conn.channel.stream_mut(), Err(&err))
					.await
					.map_err(ConnectError::Reply)?;

				return Err(err.into());
			}
		};

		trace!(destination = %routed.destination, "upstream dialed");

		let client = match &mut routed.conn.channel {
			ClientChannel::Stream(stream) => stream,
			ClientChannel::Http { .. } => return Err(ConnectError::ChannelMismatch),
		};

		routed
			.conn
			.replies
			.after_dial(client, Ok(()))
			.await
			.map_err(ConnectError::Reply)?;

		let (client_read, client_write) = tokio::io::split(client);
		let (upstream_read, upstream_write) = upstream.split();

		// Either direction finishing (or failing) ends the tunnel; the
		// other direction's future is dropped by the select, and the
		// upstream socket with it once this function returns.
		let result = tokio::select! {
			res = relay(client_read, upstream_write, &self.opts) => {
				trace!(destination = %routed.destination, "client-to-upstream direction ended");
				res
			}
			res = relay(upstream_read, client_write, &self.opts) => {
				trace!(destination = %routed.destination, "upstream-to-client direction ended");
				res
			}
			() = cancel.cancelled() => {
				debug!(destination = %routed.destination, "tunnel cancelled by shutdown");
				Err(IoError::from(ErrorKind::Interrupted))
			}
		};

		result.map(|_| ()).map_err(ConnectError::Relay)
	}
}

/// Copy bytes from `reader` to `writer` until EOF, applying the idle
/// deadlines from `opts` to every operation. The deadline is refreshed
/// after each successful read/write, so only genuinely idle connections
/// time out.
async fn relay(
	mut reader: impl AsyncRead + Unpin,
	mut writer: impl AsyncWrite + Unpin,
	opts: &DialOptions,
) -> IoResult<u64> {
	let mut buf = vec![0_u8; opts.buffer_size];
	let mut total = 0_u64;

	loop {
		let read = timeout(opts.read_timeout, reader.read(&mut buf))
			.await
			.map_err(|_| IoError::from(ErrorKind::TimedOut))??;

		if read == 0 {
			return Ok(total);
		}

		timeout(opts.write_timeout, writer.write_all(&buf[..read]))
			.await
			.map_err(|_| IoError::from(ErrorKind::TimedOut))??;

		total += read as u64;
	}
}
