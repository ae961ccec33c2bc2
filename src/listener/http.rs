//! The HTTP and HTTPS proxy listener.
//!
//! Two request classes are served:
//!
//! - `CONNECT host:port` — the listener takes over the raw stream and
//!   dispatches a byte tunnel to the requested destination. All replies are
//!   written literally (`HTTP/1.1 200 Connection established`, `401`, `403`,
//!   `502`), which is why the request head is parsed by hand rather than
//!   going through a server framework.
//! - Plain requests with an absolute URI — the request head and body are
//!   buffered, hop-by-hop headers are removed, and the connection is
//!   dispatched to the round-trip connector, which replays the request
//!   upstream and relays the response.
//!
//! The HTTPS variant is identical except that accepted sockets are wrapped
//! in TLS first.

use std::{
	cmp,
	io::{Error as IoError, Result as IoResult},
	net::SocketAddr,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{
	header::{
		HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, PROXY_AUTHORIZATION,
		TRANSFER_ENCODING, USER_AGENT,
	},
	Method, Uri,
};
use thiserror::Error;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
	net::TcpStream,
	spawn,
	time::timeout,
};
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	addr::{Address, Destination, IntoAddressError, Network},
	auth::parse_proxy_authorization,
	conn::{ClientChannel, ClientStream, ConnId, Connection, ProxiedRequest, Replies, ServerKind},
	connector::DialError,
	dispatch::{DispatchContext, Dispatcher},
	listener::{bind_socket, Listener, ListenerError, ListenerOptions, HANDSHAKE_TIMEOUT},
	ruleset::RulesetError,
};

/// Literal reply for an established CONNECT tunnel
const REPLY_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
/// Literal reply for a failed or missing credential
const REPLY_UNAUTHORIZED: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\n";
/// Literal reply for a ruleset denial
const REPLY_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
/// Literal reply for an upstream dial failure
const REPLY_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
/// Literal reply for an unparseable or unsupported request
const REPLY_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Upper bound on the size of a request head
const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Upper bound on a buffered request body for the round-trip path
const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;
/// Maximum number of request headers parsed
const MAX_HEADERS: usize = 64;

/// The fixed set of hop-by-hop headers removed from proxied requests and
/// responses, in addition to anything listed in `Connection`
const HOP_BY_HOP_HEADERS: [&str; 8] = [
	"proxy-connection",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailers",
	"transfer-encoding",
	"upgrade",
	"keep-alive",
];

/// The error returned when a request can not be turned into a dispatchable
/// connection. Every variant except IO failures is answered with `400`.
#[derive(Debug, Error)]
enum RequestError {
	/// The client closed or broke the stream mid-head
	#[error("could not read the request head")]
	Io(#[from] IoError),
	/// The request head exceeds [`MAX_HEAD_SIZE`]
	#[error("request head too large")]
	HeadTooLarge,
	/// The request head is not parseable HTTP
	#[error("malformed request head")]
	Parse(#[from] httparse::Error),
	/// A header name or value is not representable
	#[error("malformed request header")]
	BadHeader,
	/// The request body uses chunked transfer encoding, which the
	/// round-trip path does not accept
	#[error("chunked request bodies are not supported")]
	ChunkedBody,
	/// The declared request body exceeds [`MAX_BODY_SIZE`]
	#[error("request body too large")]
	BodyTooLarge,
}

/// A parsed request head
#[derive(Debug)]
struct RequestHead {
	method: Method,
	/// The raw request target: an authority for CONNECT, an absolute URI
	/// for plain requests
	target: String,
	headers: HeaderMap,
}

/// The HTTP (and, with TLS, HTTPS) proxy listener. Binds its socket at
/// construction time.
pub struct HttpListener {
	opts: ListenerOptions,
	listener: tokio::net::TcpListener,
	tls: Option<TlsAcceptor>,
	dispatcher: Arc<Dispatcher>,
}

impl HttpListener {
	/// Create a plain HTTP proxy listener, validating the options and
	/// binding the listening socket.
	///
	/// # Errors
	/// Returns a [`ListenerError`] when the options are invalid or the
	/// socket can not be bound.
	pub fn new(opts: ListenerOptions, dispatcher: Arc<Dispatcher>) -> Result<Self, ListenerError> {
		opts.validate()?;
		let listener = bind_socket(opts.socket_addr())?;

		Ok(Self {
			opts,
			listener,
			tls: None,
			dispatcher,
		})
	}

	/// Create an HTTPS proxy listener wrapping every accepted socket in
	/// TLS with the provided server configuration.
	///
	/// # Errors
	/// Returns a [`ListenerError`] when the options are invalid or the
	/// socket can not be bound.
	pub fn with_tls(
		opts: ListenerOptions,
		tls_config: Arc<ServerConfig>,
		dispatcher: Arc<Dispatcher>,
	) -> Result<Self, ListenerError> {
		let mut listener = Self::new(opts, dispatcher)?;
		listener.tls = Some(TlsAcceptor::from(tls_config));

		Ok(listener)
	}

	/// The kind of server this listener presents as
	#[must_use]
	pub const fn kind(&self) -> ServerKind {
		if self.tls.is_some() {
			ServerKind::Https
		} else {
			ServerKind::Http
		}
	}

	/// The address the listening socket is actually bound to
	///
	/// # Errors
	/// Returns the underlying IO error if the socket is gone.
	pub fn local_addr(&self) -> IoResult<SocketAddr> {
		self.listener.local_addr()
	}
}

#[async_trait]
impl Listener for HttpListener {
	async fn listen(&self, cancel: CancellationToken) -> Result<(), ListenerError> {
		let addr = self.bound_addr();
		let kind = self.kind();

		if self.opts.auth {
			info!(%addr, "{kind}: listening");
		} else {
			info!(%addr, "{kind}: listening (no auth)");
		}

		loop {
			tokio::select! {
				res = self.listener.accept() => match res {
					Ok((stream, peer)) => {
						let dispatcher = Arc::clone(&self.dispatcher);
						let auth = self.opts.auth;
						let tls = self.tls.clone();
						let cancel = cancel.child_token();

						spawn(async move {
							serve_peer(dispatcher, kind, auth, tls, stream, peer, cancel).await;
						});
					}
					Err(err) => {
						warn!(?err, %addr, "error accepting {kind} connection");
					}
				},
				() = cancel.cancelled() => {
					debug!(%addr, "{kind}: listener shutting down");
					return Ok(());
				}
			}
		}
	}

	fn bound_addr(&self) -> SocketAddr {
		self.local_addr().unwrap_or_else(|_| self.opts.socket_addr())
	}
}

/// Accept one peer: TLS handshake if configured, head parse, then hand off
/// to the CONNECT or round-trip path.
async fn serve_peer(
	dispatcher: Arc<Dispatcher>,
	kind: ServerKind,
	auth: bool,
	tls: Option<TlsAcceptor>,
	stream: TcpStream,
	peer: SocketAddr,
	cancel: CancellationToken,
) {
	let id = ConnId::generate();

	let mut client: ClientStream = if let Some(acceptor) = tls {
		match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
			Ok(Ok(stream)) => Box::new(stream),
			Ok(Err(err)) => {
				debug!(%id, %peer, ?err, "error accepting tls connection");
				return;
			}
			Err(_) => {
				debug!(%id, %peer, "tls handshake timed out");
				return;
			}
		}
	} else {
		Box::new(stream)
	};

	let (head, leftover) = match timeout(HANDSHAKE_TIMEOUT, read_head(&mut client)).await {
		Ok(Ok(head)) => head,
		Ok(Err(err)) => {
			let _ = client.write_all(REPLY_BAD_REQUEST).await;
			debug!(%id, %peer, err = %err, "{kind}: unreadable request head");
			return;
		}
		Err(_) => {
			debug!(%id, %peer, "{kind}: request head timed out");
			return;
		}
	};

	let head = match parse_head(&head) {
		Ok(head) => head,
		Err(err) => {
			let _ = client.write_all(REPLY_BAD_REQUEST).await;
			debug!(%id, %peer, err = %err, "{kind}: malformed request head");
			return;
		}
	};

	if head.method == Method::CONNECT {
		serve_connect(dispatcher, kind, auth, id, client, leftover, head, peer, cancel).await;
	} else {
		serve_plain(dispatcher, kind, auth, id, client, leftover, head, peer, cancel).await;
	}
}

/// Serve a CONNECT tunnel request.
#[allow(clippy::too_many_arguments)]
async fn serve_connect(
	dispatcher: Arc<Dispatcher>,
	kind: ServerKind,
	auth: bool,
	id: ConnId,
	mut client: ClientStream,
	leftover: Vec<u8>,
	mut head: RequestHead,
	peer: SocketAddr,
	cancel: CancellationToken,
) {
	let identity = if auth {
		match check_auth(&dispatcher, &head.headers, peer).await {
			Ok(identity) => identity,
			Err(err) => {
				let _ = client.write_all(REPLY_UNAUTHORIZED).await;
				debug!(%id, %peer, err = %err, "{kind}: authentication rejected");
				return;
			}
		}
	} else {
		None
	};

	strip_hop_by_hop(&mut head.headers);

	let destination = match parse_host_address(&head.target) {
		Ok(address) => address,
		Err(err) => {
			let _ = client.write_all(REPLY_BAD_REQUEST).await;
			debug!(%id, %peer, err = %err, "{kind}: bad connect target");
			return;
		}
	};

	debug!(%id, %peer, %destination, "{kind}: connect");

	let conn = Connection {
		id: id.clone(),
		kind,
		source: peer,
		destination: Some(Destination::new(Network::Tcp, destination)),
		identity,
		channel: ClientChannel::Stream(Box::new(PrefixedStream::new(leftover, client))),
		replies: Box::new(ConnectReplies),
	};

	dispatcher
		.dispatch(DispatchContext::new(id, kind, cancel), conn)
		.await;
}

/// Serve a plain (absolute-URI) proxy request by buffering it for the
/// round-trip connector.
#[allow(clippy::too_many_arguments)]
async fn serve_plain(
	dispatcher: Arc<Dispatcher>,
	kind: ServerKind,
	auth: bool,
	id: ConnId,
	mut client: ClientStream,
	leftover: Vec<u8>,
	mut head: RequestHead,
	peer: SocketAddr,
	cancel: CancellationToken,
) {
	let uri: Uri = match head.target.parse() {
		Ok(uri) => uri,
		Err(_) => {
			let _ = client.write_all(REPLY_BAD_REQUEST).await;
			debug!(%id, %peer, "{kind}: unparseable request uri");
			return;
		}
	};

	// RFC 7230: a proxy request line carries an absolute URI
	if uri.scheme().is_none() || uri.authority().is_none() {
		let _ = client.write_all(REPLY_BAD_REQUEST).await;
		debug!(%id, %peer, "{kind}: request uri is not absolute");
		return;
	}

	let identity = if auth {
		match check_auth(&dispatcher, &head.headers, peer).await {
			Ok(identity) => identity,
			Err(err) => {
				let _ = client.write_all(REPLY_UNAUTHORIZED).await;
				debug!(%id, %peer, err = %err, "{kind}: authentication rejected");
				return;
			}
		}
	} else {
		None
	};

	// An absent User-Agent must stay absent upstream rather than turning
	// into some HTTP library's default
	if !head.headers.contains_key(USER_AGENT) {
		head.headers.insert(USER_AGENT, HeaderValue::from_static(""));
	}

	let body = match read_body(&mut client, &head.headers, leftover).await {
		Ok(body) => body,
		Err(err) => {
			let _ = client.write_all(REPLY_BAD_REQUEST).await;
			debug!(%id, %peer, err = %err, "{kind}: unusable request body");
			return;
		}
	};

	strip_hop_by_hop(&mut head.headers);

	let destination = Address::new(
		match uri.host() {
			Some(host) => match host.parse() {
				Ok(ip) => crate::addr::Host::Ip(ip),
				Err(_) => crate::addr::Host::Domain(host.to_string()),
			},
			None => {
				let _ = client.write_all(REPLY_BAD_REQUEST).await;
				return;
			}
		},
		uri.port_u16().unwrap_or(80),
	);

	debug!(%id, %peer, %destination, method = %head.method, "{kind}: plain request");

	let request = ProxiedRequest {
		method: head.method,
		uri,
		headers: head.headers,
		body,
	};

	let conn = Connection {
		id: id.clone(),
		kind,
		source: peer,
		destination: Some(Destination::new(Network::Hrtp, destination)),
		identity,
		channel: ClientChannel::Http {
			request,
			stream: client,
		},
		replies: Box::new(HrtpReplies),
	};

	dispatcher
		.dispatch(DispatchContext::new(id, kind, cancel), conn)
		.await;
}

/// Check the `Proxy-Authorization` header against the dispatcher,
/// returning the basic username (the ruleset identity) on success
async fn check_auth(
	dispatcher: &Dispatcher,
	headers: &HeaderMap,
	peer: SocketAddr,
) -> Result<Option<String>, crate::auth::AuthError> {
	let value = headers
		.get(PROXY_AUTHORIZATION)
		.and_then(|value| value.to_str().ok());
	let authn = parse_proxy_authorization(value, peer);

	dispatcher.authenticate(&authn).await?;

	Ok(basic_username(&authn.credential))
}

/// The username half of a basic credential, used as the ruleset identity
fn basic_username(credential: &str) -> Option<String> {
	credential
		.split_once(':')
		.map(|(username, _)| username.to_string())
}

/// Read from `stream` until the end of the request head. Returns the head
/// bytes and any bytes read past it.
async fn read_head(stream: &mut ClientStream) -> Result<(Vec<u8>, Vec<u8>), RequestError> {
	let mut buf = Vec::with_capacity(1024);
	let mut chunk = [0_u8; 1024];

	loop {
		if let Some(end) = find_head_end(&buf) {
			let leftover = buf.split_off(end);
			return Ok((buf, leftover));
		}

		if buf.len() > MAX_HEAD_SIZE {
			return Err(RequestError::HeadTooLarge);
		}

		let read = stream.read(&mut chunk).await?;

		if read == 0 {
			return Err(RequestError::Io(IoError::from(
				std::io::ErrorKind::UnexpectedEof,
			)));
		}

		buf.extend_from_slice(&chunk[..read]);
	}
}

/// Find the index just past the `\r\n\r\n` terminating a request head
fn find_head_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4)
		.position(|window| window == b"\r\n\r\n")
		.map(|pos| pos + 4)
}

/// Parse a raw request head into method, target, and headers
fn parse_head(head: &[u8]) -> Result<RequestHead, RequestError> {
	let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut request = httparse::Request::new(&mut header_storage);

	match request.parse(head)? {
		httparse::Status::Complete(_) => (),
		httparse::Status::Partial => return Err(RequestError::BadHeader),
	}

	let method = request
		.method
		.and_then(|method| Method::from_bytes(method.as_bytes()).ok())
		.ok_or(RequestError::BadHeader)?;
	let target = request.path.ok_or(RequestError::BadHeader)?.to_string();

	let mut headers = HeaderMap::with_capacity(request.headers.len());
	for header in request.headers.iter() {
		let name =
			HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| RequestError::BadHeader)?;
		let value = HeaderValue::from_bytes(header.value).map_err(|_| RequestError::BadHeader)?;
		headers.append(name, value);
	}

	Ok(RequestHead {
		method,
		target,
		headers,
	})
}

/// Buffer the request body for the round-trip path. The body is either
/// empty, or delimited by `Content-Length`; chunked request bodies are
/// rejected.
async fn read_body(
	stream: &mut ClientStream,
	headers: &HeaderMap,
	leftover: Vec<u8>,
) -> Result<Bytes, RequestError> {
	let chunked = headers
		.get(TRANSFER_ENCODING)
		.and_then(|value| value.to_str().ok())
		.is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));

	if chunked {
		return Err(RequestError::ChunkedBody);
	}

	let length = headers
		.get(CONTENT_LENGTH)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.parse::<usize>().ok())
		.unwrap_or(0);

	if length > MAX_BODY_SIZE {
		return Err(RequestError::BodyTooLarge);
	}

	let mut body = leftover;
	body.truncate(length);

	while body.len() < length {
		let mut chunk = vec![0_u8; (length - body.len()).min(16 * 1024)];
		let read = stream.read(&mut chunk).await?;

		if read == 0 {
			return Err(RequestError::Io(IoError::from(
				std::io::ErrorKind::UnexpectedEof,
			)));
		}

		body.extend_from_slice(&chunk[..read]);
	}

	Ok(Bytes::from(body))
}

/// Remove hop-by-hop headers: the fixed set, plus every header named in the
/// `Connection` header. Idempotent.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let listed: Vec<HeaderName> = headers
		.get_all(CONNECTION)
		.iter()
		.filter_map(|value| value.to_str().ok())
		.flat_map(|value| value.split(','))
		.filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
		.collect();

	for name in listed {
		headers.remove(name);
	}

	headers.remove(CONNECTION);

	for name in HOP_BY_HOP_HEADERS {
		headers.remove(name);
	}
}

/// Parse an authority (`host` or `host:port`) into an [`Address`],
/// defaulting to port 80
fn parse_host_address(host: &str) -> Result<Address, IntoAddressError> {
	let has_port = match (host.rfind(':'), host.rfind(']')) {
		(Some(colon), Some(bracket)) => colon > bracket,
		(Some(colon), None) => colon > 0,
		(None, _) => false,
	};

	if has_port {
		host.parse()
	} else {
		format!("{host}:80").parse()
	}
}

/// A client stream with some already-read bytes stitched back in front of
/// it. Reads drain the prefix first; writes go straight through.
struct PrefixedStream {
	prefix: Vec<u8>,
	pos: usize,
	inner: ClientStream,
}

impl PrefixedStream {
	fn new(prefix: Vec<u8>, inner: ClientStream) -> Self {
		Self {
			prefix,
			pos: 0,
			inner,
		}
	}
}

impl AsyncRead for PrefixedStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<IoResult<()>> {
		let this = self.get_mut();

		if this.pos < this.prefix.len() {
			let take = cmp::min(buf.remaining(), this.prefix.len() - this.pos);
			buf.put_slice(&this.prefix[this.pos..this.pos + take]);
			this.pos += take;

			if this.pos == this.prefix.len() {
				this.prefix = Vec::new();
				this.pos = 0;
			}

			return Poll::Ready(Ok(()));
		}

		Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for PrefixedStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, IoError>> {
		Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

/// Dispatch-phase wire replies for a CONNECT tunnel.
pub(crate) struct ConnectReplies;

#[async_trait]
impl Replies for ConnectReplies {
	async fn after_ruleset(
		&self,
		stream: &mut ClientStream,
		outcome: &Result<(), RulesetError>,
	) -> IoResult<()> {
		match outcome {
			Ok(()) | Err(RulesetError::NoMatch) => Ok(()),
			Err(RulesetError::Denied) => stream.write_all(REPLY_FORBIDDEN).await,
		}
	}

	async fn after_dial(
		&self,
		stream: &mut ClientStream,
		outcome: Result<(), &DialError>,
	) -> IoResult<()> {
		match outcome {
			Ok(()) => stream.write_all(REPLY_ESTABLISHED).await,
			Err(_) => stream.write_all(REPLY_BAD_GATEWAY).await,
		}
	}
}

/// Dispatch-phase wire replies for the round-trip path. The success reply
/// is the proxied upstream response itself, so only failures write here.
pub(crate) struct HrtpReplies;

#[async_trait]
impl Replies for HrtpReplies {
	async fn after_ruleset(
		&self,
		stream: &mut ClientStream,
		outcome: &Result<(), RulesetError>,
	) -> IoResult<()> {
		match outcome {
			Ok(()) | Err(RulesetError::NoMatch) => Ok(()),
			Err(RulesetError::Denied) => stream.write_all(REPLY_FORBIDDEN).await,
		}
	}

	async fn after_dial(
		&self,
		stream: &mut ClientStream,
		outcome: Result<(), &DialError>,
	) -> IoResult<()> {
		match outcome {
			Ok(()) => Ok(()),
			Err(_) => stream.write_all(REPLY_BAD_GATEWAY).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::duplex;

	use super::*;

	fn headers_from(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut headers = HeaderMap::new();
		for (name, value) in pairs {
			headers.append(
				HeaderName::from_bytes(name.as_bytes()).unwrap(),
				HeaderValue::from_str(value).unwrap(),
			);
		}
		headers
	}

	#[test]
	fn hop_by_hop_fixed_set() {
		let mut headers = headers_from(&[
			("proxy-connection", "keep-alive"),
			("proxy-authorization", "Basic abc"),
			("te", "trailers"),
			("trailers", "x"),
			("transfer-encoding", "chunked"),
			("upgrade", "websocket"),
			("keep-alive", "timeout=5"),
			("proxy-authenticate", "Basic"),
			("host", "example.com"),
			("accept", "*/*"),
		]);

		strip_hop_by_hop(&mut headers);

		assert_eq!(headers.len(), 2);
		assert!(headers.contains_key("host"));
		assert!(headers.contains_key("accept"));
	}

	#[test]
	fn hop_by_hop_connection_listed() {
		let mut headers = headers_from(&[
			("connection", "close, X-Custom-Hop"),
			("x-custom-hop", "value"),
			("x-end-to-end", "value"),
		]);

		strip_hop_by_hop(&mut headers);

		assert!(!headers.contains_key("connection"));
		assert!(!headers.contains_key("x-custom-hop"));
		assert!(headers.contains_key("x-end-to-end"));
	}

	#[test]
	fn hop_by_hop_idempotent() {
		let mut headers = headers_from(&[
			("connection", "x-hop"),
			("x-hop", "1"),
			("content-type", "text/plain"),
		]);

		strip_hop_by_hop(&mut headers);
		let after_first = headers.clone();
		strip_hop_by_hop(&mut headers);

		assert_eq!(headers, after_first);
		assert_eq!(headers.len(), 1);
	}

	#[test]
	fn host_address_defaults_port() {
		assert_eq!(
			parse_host_address("example.com").unwrap(),
			"example.com:80".parse().unwrap()
		);
		assert_eq!(
			parse_host_address("example.com:443").unwrap(),
			"example.com:443".parse().unwrap()
		);
		assert_eq!(
			parse_host_address("[::1]").unwrap(),
			"[::1]:80".parse().unwrap()
		);
		assert_eq!(
			parse_host_address("[::1]:8443").unwrap(),
			"[::1]:8443".parse().unwrap()
		);
	}

	#[test]
	fn parse_connect_head() {
		let head = parse_head(
			b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
		)
		.unwrap();

		assert_eq!(head.method, Method::CONNECT);
		assert_eq!(head.target, "example.com:443");
		assert_eq!(
			head.headers.get(PROXY_AUTHORIZATION).unwrap(),
			"Basic dXNlcjpwYXNz"
		);
	}

	#[test]
	fn parse_absolute_head() {
		let head =
			parse_head(b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();

		assert_eq!(head.method, Method::GET);
		assert_eq!(head.target, "http://example.com/x");
	}

	#[tokio::test]
	async fn read_head_splits_leftover() {
		let (mut near, far) = duplex(256);
		let mut far: ClientStream = Box::new(far);

		near.write_all(b"CONNECT a:1 HTTP/1.1\r\n\r\nEARLYDATA")
			.await
			.unwrap();

		let (head, leftover) = read_head(&mut far).await.unwrap();

		assert!(head.ends_with(b"\r\n\r\n"));
		assert_eq!(leftover, b"EARLYDATA");
	}

	#[tokio::test]
	async fn prefixed_stream_reads_prefix_first() {
		let (mut near, far) = duplex(64);
		near.write_all(b"-after").await.unwrap();
		drop(near);

		let mut stream = PrefixedStream::new(b"before".to_vec(), Box::new(far));

		let mut out = Vec::new();
		stream.read_to_end(&mut out).await.unwrap();

		assert_eq!(&out, b"before-after");
	}

	#[tokio::test]
	async fn read_body_uses_leftover_and_stream() {
		let (mut near, far) = duplex(64);
		let mut far: ClientStream = Box::new(far);

		near.write_all(b"67890").await.unwrap();

		let headers = headers_from(&[("content-length", "10")]);
		let body = read_body(&mut far, &headers, b"12345".to_vec())
			.await
			.unwrap();

		assert_eq!(&body[..], b"1234567890");
	}

	#[tokio::test]
	async fn read_body_rejects_chunked() {
		let (_near, far) = duplex(64);
		let mut far: ClientStream = Box::new(far);

		let headers = headers_from(&[("transfer-encoding", "chunked")]);

		assert!(matches!(
			read_body(&mut far, &headers, Vec::new()).await,
			Err(RequestError::ChunkedBody)
		));
	}
}
