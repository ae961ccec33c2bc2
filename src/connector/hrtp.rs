//! The HTTP round-trip connector for plain (non-CONNECT) proxy requests.
//!
//! Instead of tunneling bytes, this connector replays the client's request
//! against the upstream over a one-shot HTTP/1.1 client connection, then
//! writes the upstream's status, headers, and body back to the client.
//! Chunked responses are re-encoded chunk by chunk with an explicit flush
//! after each one, so streaming responses reach the client as they arrive.

use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use http_body_util::{BodyExt, Full};
use hyper::{
	body::Bytes,
	client::conn::http1,
	header::{HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
	Response, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
	conn::{ClientChannel, ClientStream, ProxiedRequest, Replies as _},
	connector::{dial, ConnectError, DialOptions},
	listener::http::strip_hop_by_hop,
	router::Routed,
};

/// A connector that performs the client's HTTP request upstream and relays
/// the response. Stateless across connections and safe to share.
#[derive(Debug, Default)]
pub struct HrtpConnector {
	opts: DialOptions,
}

impl HrtpConnector {
	/// Create a round-trip connector with the provided dial options
	#[must_use]
	pub const fn new(opts: DialOptions) -> Self {
		Self { opts }
	}

	/// Dial the routed destination, fire the dialed reply, round-trip the
	/// request, and relay the response to the client.
	///
	/// # Errors
	/// Returns a [`ConnectError`] for dial, round-trip, and relay failures.
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

		let upstream = match dialed {
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

		let ClientChannel::Http { request, stream } = &mut routed.conn.channel else {
			return Err(ConnectError::ChannelMismatch);
		};

		routed
			.conn
			.replies
			.after_dial(stream, Ok(()))
			.await
			.map_err(ConnectError::Reply)?;

		let (mut sender, driver) = http1::handshake(TokioIo::new(upstream))
			.await
			.map_err(ConnectError::RoundTrip)?;

		// The driver pumps the upstream socket until the response (and its
		// body) has been fully received or the connection dies.
		tokio::spawn(async move {
			if let Err(err) = driver.await {
				debug!(?err, "upstream http connection ended with an error");
			}
		});

		let upstream_request = build_upstream_request(request);

		let response = tokio::select! {
			res = sender.send_request(upstream_request) => res.map_err(ConnectError::RoundTrip)?,
			() = cancel.cancelled() => {
				return Err(ConnectError::Relay(IoError::from(ErrorKind::Interrupted)));
			}
		};

		self.relay_response(response, stream).await
	}

	/// Write the upstream response head and stream its body to the client.
	async fn relay_response(
		&self,
		response: Response<hyper::body::Incoming>,
		client: &mut ClientStream,
	) -> Result<(), ConnectError> {
		let status = response.status();
		let chunked = is_chunked(&response) && !response.headers().contains_key(CONTENT_LENGTH);

		let mut headers = response.headers().clone();
		strip_hop_by_hop(&mut headers);

		let mut head = Vec::with_capacity(256);
		head.extend_from_slice(
			format!(
				"HTTP/1.1 {} {}\r\n",
				status.as_u16(),
				status.canonical_reason().unwrap_or("")
			)
			.as_bytes(),
		);

		for name in headers.keys() {
			for value in headers.get_all(name) {
				head.extend_from_slice(name.as_str().as_bytes());
				head.extend_from_slice(b": ");
				head.extend_from_slice(value.as_bytes());
				head.extend_from_slice(b"\r\n");
			}
		}

		if chunked {
			head.extend_from_slice(b"transfer-encoding: chunked\r\n");
		}

		head.extend_from_slice(b"\r\n");

		self.write(client, &head).await.map_err(ConnectError::Relay)?;

		let mut body = response.into_body();

		loop {
			let frame = match timeout(self.opts.read_timeout, body.frame()).await {
				Ok(Some(frame)) => frame.map_err(ConnectError::RoundTrip)?,
				Ok(None) => break,
				Err(_) => {
					return Err(ConnectError::Relay(IoError::from(ErrorKind::TimedOut)));
				}
			};

			let Ok(data) = frame.into_data() else {
				// Trailers are not forwarded
				continue;
			};

			if data.is_empty() {
				continue;
			}

			if chunked {
				let size = format!("{:x}\r\n", data.len());
				self.write(client, size.as_bytes())
					.await
					.map_err(ConnectError::Relay)?;
				self.write(client, &data).await.map_err(ConnectError::Relay)?;
				self.write(client, b"\r\n").await.map_err(ConnectError::Relay)?;
			} else {
				self.write(client, &data).await.map_err(ConnectError::Relay)?;
			}

			client.flush().await.map_err(ConnectError::Relay)?;
		}

		if chunked {
			self.write(client, b"0\r\n\r\n")
				.await
				.map_err(ConnectError::Relay)?;
		}

		client.flush().await.map_err(ConnectError::Relay)?;

		Ok(())
	}

	/// A single deadline-bounded write to the client
	async fn write(&self, client: &mut ClientStream, data: &[u8]) -> IoResult<()> {
		timeout(self.opts.write_timeout, client.write_all(data))
			.await
			.map_err(|_| IoError::from(ErrorKind::TimedOut))?
	}
}

/// Turn the buffered client request into the origin-form request sent to the
/// upstream server.
fn build_upstream_request(request: &ProxiedRequest) -> hyper::Request<Full<Bytes>> {
	let mut upstream_request = hyper::Request::new(Full::new(request.body.clone()));

	*upstream_request.method_mut() = request.method.clone();
	*upstream_request.uri_mut() = request
		.uri
		.path_and_query()
		.cloned()
		.map_or_else(|| Uri::from_static("/"), Uri::from);
	*upstream_request.headers_mut() = request.headers.clone();

	// The Host header may have been the only carrier of the authority in
	// the original request; restore it from the URI if it went missing
	if !upstream_request.headers().contains_key(HOST) {
		if let Some(authority) = request.uri.authority() {
			if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
				upstream_request.headers_mut().insert(HOST, value);
			}
		}
	}

	upstream_request
}

/// Whether the upstream response was chunked on the wire
fn is_chunked(response: &Response<hyper::body::Incoming>) -> bool {
	response
		.headers()
		.get(TRANSFER_ENCODING)
		.and_then(|value| value.to_str().ok())
		.is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
}

#[cfg(test)]
mod tests {
	use hyper::{header::USER_AGENT, HeaderMap, Method};

	use super::*;

	#[test]
	fn upstream_request_is_origin_form() {
		let mut headers = HeaderMap::new();
		headers.insert(USER_AGENT, HeaderValue::from_static("test"));

		let request = ProxiedRequest {
			method: Method::GET,
			uri: "http://example.com/path?q=1".parse().unwrap(),
			headers,
			body: Bytes::new(),
		};

		let upstream = build_upstream_request(&request);

		assert_eq!(upstream.uri(), "/path?q=1");
		assert_eq!(upstream.method(), Method::GET);
		assert_eq!(
			upstream.headers().get(HOST),
			Some(&HeaderValue::from_static("example.com"))
		);
	}

	#[test]
	fn upstream_request_keeps_existing_host() {
		let mut headers = HeaderMap::new();
		headers.insert(HOST, HeaderValue::from_static("kept.example"));

		let request = ProxiedRequest {
			method: Method::POST,
			uri: "http://example.com/".parse().unwrap(),
			headers,
			body: Bytes::from_static(b"body"),
		};

		let upstream = build_upstream_request(&request);

		assert_eq!(
			upstream.headers().get(HOST),
			Some(&HeaderValue::from_static("kept.example"))
		);
	}
}
