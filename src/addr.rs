//! Network address and destination types used throughout conduit.
//!
//! An [`Address`] is a host/port pair where the host may be an IPv4 address,
//! an IPv6 address, or a DNS domain name. Destinations carried through the
//! dispatch pipeline start out as whatever the client requested (possibly a
//! domain) and are narrowed to an IP literal by the resolver before any
//! upstream dial happens.

use std::{
	fmt::{Debug, Display, Formatter, Result as FmtResult},
	net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
	num::ParseIntError,
	str::FromStr,
};

use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use thiserror::Error;

/// The error returned by fallible conversions into an [`Address`], containing
/// the invalid input value where useful
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntoAddressError {
	/// General address parse error
	#[error("\"{0}\" is not a valid host:port address")]
	General(String),
	/// The host part is empty
	#[error("the host part of the address is empty")]
	EmptyHost,
	/// Parse error from the IP address
	#[error("invalid IP address: {0}")]
	Ip(#[from] AddrParseError),
	/// Parse error from the port number
	#[error("invalid port number: {0}")]
	Port(#[from] ParseIntError),
}

/// The host part of an [`Address`]: an IP literal or a DNS domain name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Host {
	/// An IPv4 or IPv6 address literal
	Ip(IpAddr),
	/// A DNS domain name, not yet resolved
	Domain(String),
}

impl Host {
	/// Whether this host is a domain name (and therefore needs DNS
	/// resolution before an upstream connection can be dialed)
	#[must_use]
	pub const fn is_domain(&self) -> bool {
		matches!(self, Self::Domain(_))
	}

	/// Get the domain name, if this host is one
	#[must_use]
	pub fn as_domain(&self) -> Option<&str> {
		match self {
			Self::Domain(domain) => Some(domain),
			Self::Ip(_) => None,
		}
	}

	/// Get the IP address, if this host is one
	#[must_use]
	pub const fn ip(&self) -> Option<IpAddr> {
		match self {
			Self::Ip(ip) => Some(*ip),
			Self::Domain(_) => None,
		}
	}
}

impl Display for Host {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Ip(IpAddr::V4(ip)) => Display::fmt(ip, fmt),
			Self::Ip(IpAddr::V6(ip)) => fmt.write_fmt(format_args!("[{ip}]")),
			Self::Domain(domain) => fmt.write_str(domain),
		}
	}
}

/// A network address: a [`Host`] plus a TCP/UDP port.
///
/// # String representation
/// `host:port`, where the host is an IPv4 literal (`198.51.100.7`), an IPv6
/// literal in square brackets (`[2001:db8::1]`), or a domain name
/// (`example.com`). The port is required.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "&str", into = "String")]
pub struct Address {
	/// The host to connect to or that the peer connected from
	pub host: Host,
	/// The TCP/UDP port. Port `0` is never a valid destination.
	pub port: u16,
}

impl Address {
	/// Create a new address from a host and a port
	#[must_use]
	pub const fn new(host: Host, port: u16) -> Self {
		Self { host, port }
	}

	/// Whether this address can be dialed or matched against: the host is
	/// non-empty and the port is in `1..=65535`
	#[must_use]
	pub fn is_valid(&self) -> bool {
		let host_ok = match &self.host {
			Host::Ip(_) => true,
			Host::Domain(domain) => !domain.is_empty(),
		};

		host_ok && self.port != 0
	}

	/// Convert into a [`SocketAddr`], if the host is an IP literal
	#[must_use]
	pub const fn socket_addr(&self) -> Option<SocketAddr> {
		match self.host.ip() {
			Some(ip) => Some(SocketAddr::new(ip, self.port)),
			None => None,
		}
	}
}

impl Display for Address {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_fmt(format_args!("{}:{}", self.host, self.port))
	}
}

impl From<SocketAddr> for Address {
	fn from(addr: SocketAddr) -> Self {
		Self::new(Host::Ip(addr.ip()), addr.port())
	}
}

impl FromStr for Address {
	type Err = IntoAddressError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (host, port) = s
			.rsplit_once(':')
			.ok_or_else(|| IntoAddressError::General(s.to_string()))?;

		let host = if host.starts_with('[') && host.ends_with(']') {
			Host::Ip(Ipv6Addr::from_str(host.trim_start_matches('[').trim_end_matches(']'))?.into())
		} else if host.is_empty() {
			return Err(IntoAddressError::EmptyHost);
		} else if let Ok(ip) = Ipv4Addr::from_str(host) {
			Host::Ip(ip.into())
		} else {
			Host::Domain(host.to_string())
		};

		Ok(Self {
			host,
			port: port.parse()?,
		})
	}
}

impl TryFrom<&str> for Address {
	type Error = IntoAddressError;

	fn try_from(s: &str) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<Address> for String {
	fn from(address: Address) -> Self {
		address.to_string()
	}
}

/// The kind of transport a destination is reached over.
///
/// `hrtp` is a plain (non-CONNECT) HTTP proxy request: instead of tunneling
/// bytes, the server performs the upstream HTTP round trip itself and relays
/// the response.
#[derive(
	Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Network {
	/// Stream transport, tunneled byte-for-byte
	Tcp,
	/// Datagram transport
	Udp,
	/// HTTP request relayed by round trip rather than tunneling
	Hrtp,
}

/// Where (and over which transport) an upstream connection should go.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
	/// The transport used to reach the destination
	pub network: Network,
	/// The destination address, possibly a domain until resolved
	pub address: Address,
}

impl Destination {
	/// Create a new destination
	#[must_use]
	pub const fn new(network: Network, address: Address) -> Self {
		Self { network, address }
	}

	/// Whether the destination address is valid (see [`Address::is_valid`])
	#[must_use]
	pub fn is_valid(&self) -> bool {
		self.address.is_valid()
	}
}

impl Display for Destination {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_fmt(format_args!("{}://{}", self.network, self.address))
	}
}
