//! End-to-end SOCKS5 proxy tests.

mod util;

use std::collections::HashMap;

use conduit::config::{AuthOptions, Partial};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};
use util::{free_port, spawn_echo_upstream, TestServer};

fn socks_config(auth: Option<HashMap<String, String>>, deny: Vec<String>) -> Partial {
	Partial {
		socks_port: Some(free_port()),
		auth: auth.map(|basic| AuthOptions {
			enabled: true,
			basic,
		}),
		deny: if deny.is_empty() { None } else { Some(deny) },
		..Partial::default()
	}
}

fn users() -> HashMap<String, String> {
	HashMap::from([("user".to_string(), "pass".to_string())])
}

#[tokio::test]
async fn no_auth_connect_relays_bytes() {
	let upstream = spawn_echo_upstream().await;
	let server = TestServer::start(socks_config(None, Vec::new())).await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	// Method selection: no auth
	client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();
	assert_eq!(method, [0x05, 0x00]);

	// CONNECT to the echo upstream
	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&upstream.port().to_be_bytes());
	client.write_all(&request).await.unwrap();

	// The first reply byte is the version, then success with an IPv4 bind
	// address
	let mut reply = [0_u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[0], 0x05);
	assert_eq!(reply[1], 0x00);
	assert_eq!(reply[3], 0x01);
	assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

	// Bytes are relayed verbatim both ways
	client.write_all(b"round and round").await.unwrap();

	let mut echoed = [0_u8; 15];
	client.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"round and round");

	server.stop().await;
}

#[tokio::test]
async fn domain_destination_is_resolved() {
	let upstream = spawn_echo_upstream().await;
	let server = TestServer::start(socks_config(None, Vec::new())).await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();

	// CONNECT to "localhost" by name
	let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
	request.extend_from_slice(b"localhost");
	request.extend_from_slice(&upstream.port().to_be_bytes());
	client.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x00);

	client.write_all(b"hi").await.unwrap();
	let mut echoed = [0_u8; 2];
	client.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"hi");

	server.stop().await;
}

#[tokio::test]
async fn user_pass_wrong_password_is_rejected() {
	let server = TestServer::start(socks_config(Some(users()), Vec::new())).await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	// The server selects username/password authentication
	client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();
	assert_eq!(method, [0x05, 0x02]);

	// Sub-negotiation with a bad password
	let mut negotiation = vec![0x01, 4];
	negotiation.extend_from_slice(b"user");
	negotiation.push(5);
	negotiation.extend_from_slice(b"wrong");
	client.write_all(&negotiation).await.unwrap();

	let mut status = [0_u8; 2];
	client.read_exact(&mut status).await.unwrap();
	assert_eq!(status, [0x01, 0x01]);

	// The connection is closed without reaching the request phase
	let mut rest = [0_u8; 1];
	assert_eq!(client.read(&mut rest).await.unwrap(), 0);

	server.stop().await;
}

#[tokio::test]
async fn user_pass_correct_password_connects() {
	let upstream = spawn_echo_upstream().await;
	let server = TestServer::start(socks_config(Some(users()), Vec::new())).await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();
	assert_eq!(method, [0x05, 0x02]);

	let mut negotiation = vec![0x01, 4];
	negotiation.extend_from_slice(b"user");
	negotiation.push(4);
	negotiation.extend_from_slice(b"pass");
	client.write_all(&negotiation).await.unwrap();

	let mut status = [0_u8; 2];
	client.read_exact(&mut status).await.unwrap();
	assert_eq!(status, [0x01, 0x00]);

	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&upstream.port().to_be_bytes());
	client.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x00);

	server.stop().await;
}

#[tokio::test]
async fn ruleset_denies_with_single_reply() {
	// Deny the destination before any upstream even exists
	let denied_port = free_port();
	let server = TestServer::start(socks_config(
		None,
		vec![format!("127.0.0.1:{denied_port}")],
	))
	.await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();

	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&denied_port.to_be_bytes());
	client.write_all(&request).await.unwrap();

	// Exactly one reply record, rule failure, then close
	let mut reply = [0_u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[0], 0x05);
	assert_eq!(reply[1], 0x02);

	let mut rest = [0_u8; 1];
	assert_eq!(client.read(&mut rest).await.unwrap(), 0);

	server.stop().await;
}

#[tokio::test]
async fn unsupported_command_is_refused() {
	let server = TestServer::start(socks_config(None, Vec::new())).await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();

	// BIND
	client
		.write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
		.await
		.unwrap();

	let mut reply = [0_u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[0], 0x05);
	assert_eq!(reply[1], 0x07);

	server.stop().await;
}

#[tokio::test]
async fn dial_failure_is_classified_as_refused() {
	let closed_port = free_port();
	let server = TestServer::start(socks_config(None, Vec::new())).await;
	let mut client = TcpStream::connect(server.addrs[0]).await.unwrap();

	client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	client.read_exact(&mut method).await.unwrap();

	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&closed_port.to_be_bytes());
	client.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x05);

	server.stop().await;
}
