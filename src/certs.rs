//! TLS certificate handling for the HTTPS listener.

use std::{fs, io::Error as IoError, path::Path, sync::Arc};

use thiserror::Error;
use tokio_rustls::rustls::{
	pki_types::{CertificateDer, PrivateKeyDer},
	Error as RustlsError, ServerConfig,
};

/// The error returned when TLS material can not be loaded
#[derive(Debug, Error)]
pub enum CertError {
	/// The certificate or key file could not be read
	#[error("the certificate or key file could not be read")]
	Read(#[from] IoError),
	/// The certificate file contains no certificates
	#[error("the certificate file contains no certificates")]
	MissingCert,
	/// The private key file does not contain a usable private key
	#[error("the private key file does not contain a usable private key")]
	MissingKey,
	/// The certificate or key was rejected
	#[error("the certificate or key is invalid")]
	Invalid(#[from] RustlsError),
}

/// Read a PEM certificate chain and private key from files and build a
/// rustls server configuration for the HTTPS listener.
///
/// # IO
/// This function performs synchronous (blocking) file IO, and should only
/// be called during server setup.
///
/// # Errors
/// This function returns an error if:
/// - The certificate or key could not be read from their files
/// - The certificate or key could not be parsed or are otherwise invalid
/// - The certificate and key don't match
pub fn load_server_config(
	cert_path: impl AsRef<Path>,
	key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, CertError> {
	let certs = fs::read(cert_path)?;
	let key = fs::read(key_path)?;

	let certs: Vec<CertificateDer<'static>> =
		rustls_pemfile::certs(&mut &certs[..]).collect::<Result<_, _>>()?;

	if certs.is_empty() {
		return Err(CertError::MissingCert);
	}

	let key: PrivateKeyDer<'static> =
		rustls_pemfile::private_key(&mut &key[..])?.ok_or(CertError::MissingKey)?;

	let mut config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	config.alpn_protocols = vec![b"http/1.1".to_vec()];

	Ok(Arc::new(config))
}
