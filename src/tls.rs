// TLS listener support. Server certificate + key are required; a client CA
// turns on mutual TLS.

use crate::config::Config;
use crate::error::{Error, Result};
use rustls::pki_types::PrivateKeyDer;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from the server configuration.
pub fn build_tls_acceptor(cfg: &Config) -> Result<TlsAcceptor> {
    let cert_file = cfg
        .tls_cert_file
        .as_ref()
        .ok_or_else(|| Error::Msg("tls_cert_file not configured".into()))?;
    let key_file = cfg
        .tls_key_file
        .as_ref()
        .ok_or_else(|| Error::Msg("tls_key_file not configured".into()))?;

    let cert_data =
        fs::read(cert_file).map_err(|e| Error::Msg(format!("failed to read cert file: {e}")))?;
    let mut cert_reader = BufReader::new(&cert_data[..]);
    let cert_chain: Vec<_> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Msg(format!("failed to parse server certificate: {e}")))?;
    if cert_chain.is_empty() {
        return Err(Error::Msg("no certificate found in tls_cert_file".into()));
    }

    let key_data =
        fs::read(key_file).map_err(|e| Error::Msg(format!("failed to read key file: {e}")))?;
    let mut key_reader = BufReader::new(&key_data[..]);
    let mut keys: Vec<_> = pkcs8_private_keys(&mut key_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Msg(format!("failed to parse server key: {e}")))?;
    if keys.is_empty() {
        return Err(Error::Msg("no private key found in tls_key_file".into()));
    }
    let key = PrivateKeyDer::from(keys.remove(0));

    let builder = ServerConfig::builder();
    let server_config = match &cfg.tls_ca_file {
        Some(ca_file) => {
            let ca_data = fs::read(ca_file)
                .map_err(|e| Error::Msg(format!("failed to read CA file: {e}")))?;
            let mut ca_reader = BufReader::new(&ca_data[..]);
            let ca_certs: Vec<_> = certs(&mut ca_reader)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Msg(format!("failed to parse CA certificates: {e}")))?;
            let mut root_store = RootCertStore::empty();
            for cert in ca_certs {
                root_store
                    .add(cert)
                    .map_err(|e| Error::Msg(format!("failed to add CA certificate: {e}")))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| Error::Msg(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, key)
                .map_err(|e| Error::Msg(format!("invalid certificate/key pair: {e}")))?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::Msg(format!("invalid certificate/key pair: {e}")))?,
    };

    tracing::info!(
        mtls = cfg.tls_ca_file.is_some(),
        "TLS listener configured"
    );
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
