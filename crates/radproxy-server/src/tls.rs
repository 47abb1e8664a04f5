//! Named TLS contexts.
//!
//! Each `tls` block in the configuration becomes a [`TlsContext`] holding a
//! rustls acceptor for inbound RadSec clients and a connector for upstream
//! servers, both built over the block's CA set, certificate and key.
//!
//! Identity binding (SAN/CN matching against the peer's config entry) runs
//! after the handshake in [`crate::cert`], so the connector's verifier
//! checks the chain of trust but defers name validation: it wraps
//! `WebPkiServerVerifier` and treats its name mismatch as success. Client
//! certificates are required and chain-validated by `WebPkiClientVerifier`.

use crate::config::{ConfigError, TlsDef};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A named TLS configuration shared by the peers referencing it.
pub struct TlsContext {
    pub name: String,
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").field("name", &self.name).finish()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| {
            ConfigError::Invalid(format!("cannot read certificates from {path:?}: {error}"))
        })?;
    if certs.is_empty() {
        return Err(ConfigError::Invalid(format!("no certificates in {path:?}")));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|error| {
            ConfigError::Invalid(format!("cannot read private key from {path:?}: {error}"))
        })?
        .ok_or_else(|| ConfigError::Invalid(format!("no private key in {path:?}")))
}

fn load_roots(def: &TlsDef) -> Result<RootCertStore, ConfigError> {
    let mut files: Vec<PathBuf> = Vec::new();
    if let Some(file) = &def.ca_cert_file {
        files.push(file.into());
    }
    if let Some(dir) = &def.ca_cert_path {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
    }
    let mut roots = RootCertStore::empty();
    for file in files {
        for cert in load_certs(&file)? {
            roots.add(cert).map_err(|error| {
                ConfigError::Invalid(format!("bad CA certificate in {}: {error}", def.name))
            })?;
        }
    }
    if roots.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "TLS context '{}' has no usable CA certificates",
            def.name
        )));
    }
    Ok(roots)
}

/// Build the acceptor/connector pair for one `tls` block.
pub fn build_context(def: &TlsDef) -> Result<TlsContext, ConfigError> {
    let roots = Arc::new(load_roots(def)?);
    let chain = load_certs(Path::new(&def.cert_file))?;
    let key = load_key(Path::new(&def.cert_key_file))?;

    let client_verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|error| {
            ConfigError::Invalid(format!("TLS context '{}': {error}", def.name))
        })?;
    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(chain.clone(), key.clone_key())
        .map_err(|error| {
            ConfigError::Invalid(format!("TLS context '{}': {error}", def.name))
        })?;

    let chain_verifier = WebPkiServerVerifier::builder(roots)
        .build()
        .map_err(|error| {
            ConfigError::Invalid(format!("TLS context '{}': {error}", def.name))
        })?;
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ChainOfTrustVerifier {
            inner: chain_verifier,
        }))
        .with_client_auth_cert(chain, key)
        .map_err(|error| {
            ConfigError::Invalid(format!("TLS context '{}': {error}", def.name))
        })?;

    Ok(TlsContext {
        name: def.name.clone(),
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        connector: TlsConnector::from(Arc::new(client_config)),
    })
}

/// Server certificate verifier that enforces the chain of trust but leaves
/// name binding to the per-peer identity check after the handshake.
#[derive(Debug)]
struct ChainOfTrustVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOfTrustVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
