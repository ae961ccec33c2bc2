//! The SOCKS5 proxy listener (RFC 1928 / RFC 1929).
//!
//! Only the CONNECT command is supported. Authentication, when enabled, is
//! username/password sub-negotiation; the listener writes the RFC 1929
//! status byte itself and only then hands the connection to the dispatcher.
//! The dispatch-phase replies (rule failure, dial outcome, the success
//! record with the bind address) are written by [`SocksReplies`].

use std::{
	io::{Error as IoError, Result as IoResult},
	net::{IpAddr, Ipv4Addr, SocketAddr},
	sync::Arc,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	net::TcpStream,
	spawn,
	time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	addr::{Address, Destination, Host, Network},
	auth::{AuthError, Authentication},
	conn::{ClientChannel, ClientStream, ConnId, Connection, Replies, ServerKind},
	connector::{DialError, DialErrorKind},
	dispatch::{DispatchContext, Dispatcher},
	listener::{bind_socket, Listener, ListenerError, ListenerOptions, HANDSHAKE_TIMEOUT},
	ruleset::RulesetError,
};

/// SOCKS protocol version byte
const VERSION: u8 = 0x05;
/// RFC 1929 username/password sub-negotiation version byte
const USER_PASS_VERSION: u8 = 0x01;

/// Method: no authentication required
const METHOD_NO_AUTH: u8 = 0x00;
/// Method: username/password authentication
const METHOD_USER_PASS: u8 = 0x02;

/// Command: CONNECT
const CMD_CONNECT: u8 = 0x01;

/// Address type: IPv4
const ATYP_IPV4: u8 = 0x01;
/// Address type: domain name
const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6
const ATYP_IPV6: u8 = 0x04;

/// Reply: succeeded
const REP_SUCCESS: u8 = 0x00;
/// Reply: connection not allowed by ruleset
const REP_RULE_FAILURE: u8 = 0x02;
/// Reply: network unreachable
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
/// Reply: host unreachable
const REP_HOST_UNREACHABLE: u8 = 0x04;
/// Reply: connection refused
const REP_CONNECTION_REFUSED: u8 = 0x05;
/// Reply: command not supported
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
/// Reply: address type not supported
const REP_ADDR_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// RFC 1929 status: success
const AUTH_SUCCESS: u8 = 0x00;
/// RFC 1929 status: failure
const AUTH_FAILURE: u8 = 0x01;

/// The error returned when a SOCKS5 handshake does not produce a
/// dispatchable connection
#[derive(Debug, Error)]
pub enum HandshakeError {
	/// The method selection could not be read
	#[error("could not read the method selection")]
	MethodSelection(#[source] IoError),
	/// The client is not speaking SOCKS5
	#[error("unsupported socks version: {0:#04x}")]
	UnsupportedVersion(u8),
	/// The request carries a different version byte than the negotiation
	#[error("unsupported socks request version: {0:#04x}")]
	UnsupportedRequestVersion(u8),
	/// The client asked for a command other than CONNECT
	#[error("unsupported socks command: {0:#04x}")]
	CommandNotSupported(u8),
	/// The request could not be read
	#[error("could not read the socks request")]
	BadRequest(#[source] IoError),
	/// The request carries an unknown address type
	#[error("unsupported socks address type: {0:#04x}")]
	AddrTypeNotSupported(u8),
	/// The requested domain name is not valid UTF-8
	#[error("the requested domain name is not valid utf-8")]
	InvalidDomain,
	/// The client failed authentication; the status byte has already been
	/// written
	#[error("socks authentication rejected")]
	AuthRejected(#[source] AuthError),
	/// The sub-negotiation failed on IO
	#[error("socks handshake io failed")]
	Io(#[from] IoError),
}

impl HandshakeError {
	/// The reply code to send for this failure, if the protocol calls for
	/// one at the point where it occurs
	#[must_use]
	pub const fn reply_code(&self) -> Option<u8> {
		match self {
			Self::MethodSelection(_) | Self::UnsupportedVersion(_) => Some(REP_CONNECTION_REFUSED),
			Self::CommandNotSupported(_) => Some(REP_COMMAND_NOT_SUPPORTED),
			Self::BadRequest(_) | Self::AddrTypeNotSupported(_) | Self::InvalidDomain => {
				Some(REP_ADDR_TYPE_NOT_SUPPORTED)
			}
			Self::UnsupportedRequestVersion(_) | Self::AuthRejected(_) | Self::Io(_) => None,
		}
	}
}

/// What a successful handshake produced
#[derive(Debug)]
struct Handshake {
	/// The destination the client asked to connect to
	destination: Address,
	/// The authenticated username, if authentication ran
	identity: Option<String>,
}

/// The SOCKS5 listener. Binds its socket at construction time.
pub struct SocksListener {
	opts: ListenerOptions,
	listener: tokio::net::TcpListener,
	dispatcher: Arc<Dispatcher>,
}

impl SocksListener {
	/// Create a SOCKS5 listener, validating the options and binding the
	/// listening socket.
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
			dispatcher,
		})
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
impl Listener for SocksListener {
	async fn listen(&self, cancel: CancellationToken) -> Result<(), ListenerError> {
		let addr = self.bound_addr();

		if self.opts.auth {
			info!(%addr, "socks: listening");
		} else {
			info!(%addr, "socks: listening (no auth)");
		}

		loop {
			tokio::select! {
				res = self.listener.accept() => match res {
					Ok((stream, peer)) => {
						let dispatcher = Arc::clone(&self.dispatcher);
						let auth = self.opts.auth;
						let cancel = cancel.child_token();

						spawn(async move {
							serve_peer(dispatcher, stream, peer, auth, cancel).await;
						});
					}
					Err(err) => {
						warn!(?err, %addr, "error accepting socks connection");
					}
				},
				() = cancel.cancelled() => {
					debug!(%addr, "socks: listener shutting down");
					return Ok(());
				}
			}
		}
	}

	fn bound_addr(&self) -> SocketAddr {
		self.local_addr().unwrap_or_else(|_| self.opts.socket_addr())
	}
}

/// Handshake one peer and hand it to the dispatcher.
async fn serve_peer(
	dispatcher: Arc<Dispatcher>,
	mut stream: TcpStream,
	peer: SocketAddr,
	auth: bool,
	cancel: CancellationToken,
) {
	let id = ConnId::generate();
	let bind = stream
		.local_addr()
		.unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

	let handshake = match timeout(
		HANDSHAKE_TIMEOUT,
		handshake(&mut stream, peer, auth, &dispatcher),
	)
	.await
	{
		Ok(Ok(handshake)) => handshake,
		Ok(Err(err)) => {
			if let Some(code) = err.reply_code() {
				let _ = write_reply(&mut stream, code, None).await;
			}
			debug!(%id, %peer, err = %err, "socks: handshake failed");
			return;
		}
		Err(_) => {
			debug!(%id, %peer, "socks: handshake timed out");
			return;
		}
	};

	debug!(%id, %peer, destination = %handshake.destination, "socks: connect");

	let conn = Connection {
		id: id.clone(),
		kind: ServerKind::Socks5,
		source: peer,
		destination: Some(Destination::new(Network::Tcp, handshake.destination)),
		identity: handshake.identity,
		channel: ClientChannel::Stream(Box::new(stream)),
		replies: Box::new(SocksReplies { bind }),
	};

	dispatcher
		.dispatch(DispatchContext::new(id, ServerKind::Socks5, cancel), conn)
		.await;
}

/// Run the SOCKS5 handshake state machine over `stream`.
async fn handshake(
	stream: &mut TcpStream,
	peer: SocketAddr,
	auth: bool,
	dispatcher: &Dispatcher,
) -> Result<Handshake, HandshakeError> {
	read_method_selection(stream).await?;

	let identity = if auth {
		Some(authenticate(stream, peer, dispatcher).await?)
	} else {
		stream
			.write_all(&[VERSION, METHOD_NO_AUTH])
			.await
			.map_err(HandshakeError::Io)?;
		None
	};

	let destination = read_request(stream).await?;

	Ok(Handshake {
		destination,
		identity,
	})
}

/// Read and check the client's method selection message
async fn read_method_selection<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), HandshakeError> {
	let mut head = [0_u8; 2];
	stream
		.read_exact(&mut head)
		.await
		.map_err(HandshakeError::MethodSelection)?;

	if head[0] != VERSION {
		return Err(HandshakeError::UnsupportedVersion(head[0]));
	}

	let mut methods = vec![0_u8; head[1] as usize];
	stream
		.read_exact(&mut methods)
		.await
		.map_err(HandshakeError::MethodSelection)?;

	Ok(())
}

/// Offer username/password authentication, read the sub-negotiation, check
/// the credential, and write the status byte. The status byte is written on
/// both outcomes; a rejected credential then fails the handshake.
async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
	stream: &mut S,
	peer: SocketAddr,
	dispatcher: &Dispatcher,
) -> Result<String, HandshakeError> {
	stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;

	let mut head = [0_u8; 2];
	stream.read_exact(&mut head).await?;

	if head[0] != USER_PASS_VERSION {
		return Err(HandshakeError::UnsupportedRequestVersion(head[0]));
	}

	let mut username = vec![0_u8; head[1] as usize];
	stream.read_exact(&mut username).await?;

	let mut pass_len = [0_u8; 1];
	stream.read_exact(&mut pass_len).await?;

	let mut password = vec![0_u8; pass_len[0] as usize];
	stream.read_exact(&mut password).await?;

	let username = String::from_utf8_lossy(&username).into_owned();
	let password = String::from_utf8_lossy(&password).into_owned();

	match dispatcher
		.authenticate(&Authentication::basic(peer, &username, &password))
		.await
	{
		Ok(()) => {
			stream.write_all(&[USER_PASS_VERSION, AUTH_SUCCESS]).await?;
			Ok(username)
		}
		Err(err) => {
			stream.write_all(&[USER_PASS_VERSION, AUTH_FAILURE]).await?;
			Err(HandshakeError::AuthRejected(err))
		}
	}
}

/// Read the client's request and parse the destination address
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Address, HandshakeError> {
	let mut head = [0_u8; 4];
	stream
		.read_exact(&mut head)
		.await
		.map_err(HandshakeError::BadRequest)?;

	if head[0] != VERSION {
		return Err(HandshakeError::UnsupportedRequestVersion(head[0]));
	}

	if head[1] != CMD_CONNECT {
		return Err(HandshakeError::CommandNotSupported(head[1]));
	}

	let host = match head[3] {
		ATYP_IPV4 => {
			let mut ip = [0_u8; 4];
			stream
				.read_exact(&mut ip)
				.await
				.map_err(HandshakeError::BadRequest)?;
			Host::Ip(IpAddr::from(ip))
		}
		ATYP_IPV6 => {
			let mut ip = [0_u8; 16];
			stream
				.read_exact(&mut ip)
				.await
				.map_err(HandshakeError::BadRequest)?;
			Host::Ip(IpAddr::from(ip))
		}
		ATYP_DOMAIN => {
			let mut len = [0_u8; 1];
			stream
				.read_exact(&mut len)
				.await
				.map_err(HandshakeError::BadRequest)?;

			let mut domain = vec![0_u8; len[0] as usize];
			stream
				.read_exact(&mut domain)
				.await
				.map_err(HandshakeError::BadRequest)?;

			Host::Domain(String::from_utf8(domain).map_err(|_| HandshakeError::InvalidDomain)?)
		}
		atyp => return Err(HandshakeError::AddrTypeNotSupported(atyp)),
	};

	let mut port = [0_u8; 2];
	stream
		.read_exact(&mut port)
		.await
		.map_err(HandshakeError::BadRequest)?;

	Ok(Address::new(host, u16::from_be_bytes(port)))
}

/// Write a reply record. Success replies carry `bind` as BND.ADDR; every
/// other reply carries the zero IPv4 address.
async fn write_reply<S: AsyncWrite + Unpin>(
	stream: &mut S,
	code: u8,
	bind: Option<SocketAddr>,
) -> IoResult<()> {
	let addr = match (code, bind) {
		(REP_SUCCESS, Some(addr)) => addr,
		_ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
	};

	let mut reply = Vec::with_capacity(22);
	reply.extend_from_slice(&[VERSION, code, 0x00]);

	match addr.ip() {
		IpAddr::V4(ip) => {
			reply.push(ATYP_IPV4);
			reply.extend_from_slice(&ip.octets());
		}
		IpAddr::V6(ip) => {
			reply.push(ATYP_IPV6);
			reply.extend_from_slice(&ip.octets());
		}
	}

	reply.extend_from_slice(&addr.port().to_be_bytes());

	stream.write_all(&reply).await
}

/// Dispatch-phase wire replies for one SOCKS5 connection.
pub(crate) struct SocksReplies {
	/// The local address of the accepted socket, reported as BND.ADDR in
	/// the success reply
	bind: SocketAddr,
}

#[async_trait]
impl Replies for SocksReplies {
	async fn after_ruleset(
		&self,
		stream: &mut ClientStream,
		outcome: &Result<(), RulesetError>,
	) -> IoResult<()> {
		match outcome {
			Ok(()) | Err(RulesetError::NoMatch) => Ok(()),
			Err(RulesetError::Denied) => write_reply(stream, REP_RULE_FAILURE, None).await,
		}
	}

	async fn after_dial(
		&self,
		stream: &mut ClientStream,
		outcome: Result<(), &DialError>,
	) -> IoResult<()> {
		match outcome {
			Ok(()) => write_reply(stream, REP_SUCCESS, Some(self.bind)).await,
			Err(err) => {
				let code = match err.kind() {
					DialErrorKind::Refused => REP_CONNECTION_REFUSED,
					DialErrorKind::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
					DialErrorKind::HostUnreachable | DialErrorKind::Other => REP_HOST_UNREACHABLE,
				};

				write_reply(stream, code, None).await
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::duplex;

	use super::*;

	#[tokio::test]
	async fn method_selection_ok() {
		let (mut client, mut server) = duplex(64);

		client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

		read_method_selection(&mut server).await.unwrap();
	}

	#[tokio::test]
	async fn method_selection_wrong_version() {
		let (mut client, mut server) = duplex(64);

		client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

		let err = read_method_selection(&mut server).await.unwrap_err();

		assert!(matches!(err, HandshakeError::UnsupportedVersion(0x04)));
		assert_eq!(err.reply_code(), Some(REP_CONNECTION_REFUSED));
	}

	#[tokio::test]
	async fn request_ipv4() {
		let (mut client, mut server) = duplex(64);

		client
			.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
			.await
			.unwrap();

		let addr = read_request(&mut server).await.unwrap();

		assert_eq!(addr, "127.0.0.1:80".parse().unwrap());
	}

	#[tokio::test]
	async fn request_domain() {
		let (mut client, mut server) = duplex(64);

		let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
		req.extend_from_slice(b"example.com");
		req.extend_from_slice(&443_u16.to_be_bytes());
		client.write_all(&req).await.unwrap();

		let addr = read_request(&mut server).await.unwrap();

		assert_eq!(addr, "example.com:443".parse().unwrap());
	}

	#[tokio::test]
	async fn request_ipv6() {
		let (mut client, mut server) = duplex(64);

		let mut req = vec![0x05, 0x01, 0x00, 0x04];
		req.extend_from_slice(&[0; 15]);
		req.push(1);
		req.extend_from_slice(&8080_u16.to_be_bytes());
		client.write_all(&req).await.unwrap();

		let addr = read_request(&mut server).await.unwrap();

		assert_eq!(addr, "[::1]:8080".parse().unwrap());
	}

	#[tokio::test]
	async fn request_bad_command() {
		let (mut client, mut server) = duplex(64);

		// BIND is not supported
		client
			.write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
			.await
			.unwrap();

		let err = read_request(&mut server).await.unwrap_err();

		assert!(matches!(err, HandshakeError::CommandNotSupported(0x02)));
		assert_eq!(err.reply_code(), Some(REP_COMMAND_NOT_SUPPORTED));
	}

	#[tokio::test]
	async fn request_bad_addr_type() {
		let (mut client, mut server) = duplex(64);

		client
			.write_all(&[0x05, 0x01, 0x00, 0x09, 0, 0])
			.await
			.unwrap();

		let err = read_request(&mut server).await.unwrap_err();

		assert_eq!(err.reply_code(), Some(REP_ADDR_TYPE_NOT_SUPPORTED));
	}

	#[tokio::test]
	async fn reply_round_trips_bind_family() {
		let (mut near, mut far) = duplex(64);

		let bind: SocketAddr = ([192, 0, 2, 1], 1080).into();
		write_reply(&mut near, REP_SUCCESS, Some(bind)).await.unwrap();

		let mut reply = [0_u8; 10];
		far.read_exact(&mut reply).await.unwrap();

		assert_eq!(reply[0], 0x05);
		assert_eq!(reply[1], REP_SUCCESS);
		assert_eq!(reply[3], ATYP_IPV4);
		assert_eq!(&reply[4..8], &[192, 0, 2, 1]);
		assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 1080);
	}

	#[tokio::test]
	async fn failure_reply_is_zero_addr() {
		let (mut near, mut far) = duplex(64);

		write_reply(&mut near, REP_RULE_FAILURE, None).await.unwrap();

		let mut reply = [0_u8; 10];
		far.read_exact(&mut reply).await.unwrap();

		assert_eq!(reply[1], REP_RULE_FAILURE);
		assert_eq!(&reply[4..8], &[0, 0, 0, 0]);
	}
}
