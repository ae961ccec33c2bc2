//! Utilities for end-to-end tests of the conduit server.
//!
//! Servers are booted in-process on ephemeral localhost ports, together
//! with small upstream fixtures the proxied connections terminate at.

use std::net::SocketAddr;

use conduit::{
	config::{Config, Partial},
	instance::Instance,
	listener::ListenerError,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// A conduit server running in the background of a test.
pub struct TestServer {
	/// The addresses the instance's listeners are bound to, in wiring
	/// order (http, https, socks, then forward rules, skipping disabled
	/// ones)
	pub addrs: Vec<SocketAddr>,
	shutdown: CancellationToken,
	handle: JoinHandle<Result<(), ListenerError>>,
}

impl TestServer {
	/// Boot an instance from the provided partial configuration. Panics on
	/// any setup error.
	pub async fn start(partial: Partial) -> Self {
		let config = Config::new(None);
		config.set_from_partial(&partial);

		let instance = Instance::new(&config).expect("instance setup");
		let addrs = instance.listener_addrs();
		let shutdown = instance.shutdown_handle();
		let handle = tokio::spawn(instance.run());

		Self {
			addrs,
			shutdown,
			handle,
		}
	}

	/// Shut the server down and wait for its listeners to stop
	pub async fn stop(self) {
		self.shutdown.cancel();
		let _ = self.handle.await;
	}
}

/// Allocate a free localhost port. The port is released before returning,
/// so a race with other processes is possible but unlikely.
#[allow(dead_code)]
pub fn free_port() -> u16 {
	std::net::TcpListener::bind(("127.0.0.1", 0))
		.expect("binding an ephemeral port")
		.local_addr()
		.expect("reading the ephemeral port")
		.port()
}

/// Spawn an upstream that echoes everything it receives, connection by
/// connection, until the test ends. Returns its address.
#[allow(dead_code)]
pub async fn spawn_echo_upstream() -> SocketAddr {
	let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
	let addr = listener.local_addr().unwrap();

	tokio::spawn(async move {
		loop {
			let Ok((mut peer, _)) = listener.accept().await else {
				return;
			};

			tokio::spawn(async move {
				let mut buf = [0_u8; 1024];

				while let Ok(read) = peer.read(&mut buf).await {
					if read == 0 || peer.write_all(&buf[..read]).await.is_err() {
						break;
					}
				}
			});
		}
	});

	addr
}

/// Spawn an upstream HTTP server that answers every request with a chunked
/// `200 OK` (`first` + `second`), advertising `Connection: close` and an
/// `X-Upstream` marker header. Returns its address.
#[allow(dead_code)]
pub async fn spawn_chunked_http_upstream() -> SocketAddr {
	let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
	let addr = listener.local_addr().unwrap();

	tokio::spawn(async move {
		loop {
			let Ok((mut peer, _)) = listener.accept().await else {
				return;
			};

			tokio::spawn(async move {
				// Read until the end of the request head
				let mut head = Vec::new();
				let mut byte = [0_u8; 1];

				while !head.ends_with(b"\r\n\r\n") {
					match peer.read(&mut byte).await {
						Ok(0) | Err(_) => return,
						Ok(_) => head.push(byte[0]),
					}
				}

				let _ = peer
					.write_all(
						b"HTTP/1.1 200 OK\r\n\
						Content-Type: text/plain\r\n\
						X-Upstream: chunky\r\n\
						Connection: close\r\n\
						Transfer-Encoding: chunked\r\n\
						\r\n\
						5\r\nfirst\r\n6\r\nsecond\r\n0\r\n\r\n",
					)
					.await;
			});
		}
	});

	addr
}

/// Read from `stream` until the end of an HTTP response head, returning
/// the head as a string.
#[allow(dead_code)]
pub async fn read_response_head(stream: &mut tokio::net::TcpStream) -> String {
	let mut head = Vec::new();
	let mut byte = [0_u8; 1];

	while !head.ends_with(b"\r\n\r\n") {
		match stream.read(&mut byte).await {
			Ok(0) | Err(_) => break,
			Ok(_) => head.push(byte[0]),
		}
	}

	String::from_utf8_lossy(&head).into_owned()
}
