//! TLS setup for the CONNECT leg
//!
//! The remote agent terminates TLS with a PEM certificate pair, or a
//! self-signed certificate when no paths are configured. The local agent
//! verifies the remote against the native roots unless verification is
//! switched off.

use crate::config::{ClientTlsConfig, ServerTlsConfig};
use anyhow::{anyhow, Context};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs;
use std::io::{self, BufReader};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// A duplex byte stream, plain TCP or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Acceptor for the CONNECT listener, `None` when TLS is disabled.
pub fn acceptor(config: &ServerTlsConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }
    let server_config = server_config(config.cert_path.as_deref(), config.key_path.as_deref())?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn server_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> anyhow::Result<rustls::ServerConfig> {
    let (cert_chain, key_der) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_pem_pair(cert, key)?,
        (None, None) => {
            warn!("No TLS certificate configured, using a self-signed certificate");
            generate_self_signed_cert()?
        }
        _ => return Err(anyhow!("tls.cert_path and tls.key_path must be set together")),
    };

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key_der)
        .context("Failed to create TLS config")
}

fn load_pem_pair(
    cert: &str,
    key: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = fs::File::open(cert).context("Failed to open certificate file")?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificate found in {}", cert));
    }

    let key_file = fs::File::open(key).context("Failed to open private key file")?;
    let key_der = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Failed to parse private key")?
        .context("No private key found")?;

    Ok((certs, key_der))
}

fn generate_self_signed_cert(
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)?;

    let cert_der = certified_key.cert.der().clone();
    let key_der = certified_key.signing_key.serialize_der();

    Ok((vec![cert_der], PrivateKeyDer::Pkcs8(key_der.into())))
}

/// Connector for dialing the remote agent, `None` when TLS is disabled.
pub fn connector(config: &ClientTlsConfig) -> anyhow::Result<Option<TlsConnector>> {
    if !config.enabled {
        return Ok(None);
    }

    let client_config = if config.skip_cert_verification {
        warn!("SKIPPING CERTIFICATE VERIFICATION - This is insecure!");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs()
            .context("Failed to load native root certificates")?;
        let (added, ignored) = root_store.add_parsable_certificates(native);
        debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
        if root_store.is_empty() {
            return Err(anyhow!("No usable root certificates found"));
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(Some(TlsConnector::from(Arc::new(client_config))))
}

/// SNI name for `host`; IP literals are accepted as IP server names.
pub fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid TLS server name {}: {}", host, e),
        )
    })
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
