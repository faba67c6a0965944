//! TLS configuration loading for secure sockets.
//!
//! Builds rustls server/client configs from the `tls_server_cert`,
//! `tls_server_key`, and `tls_ca_cert` configuration keys so an embedding
//! node can hand [`Socket::set_secure_server`](crate::Socket::set_secure_server)
//! and [`Socket::set_secure_client`](crate::Socket::set_secure_client) a
//! ready-made config.

use crate::config::get_namespaced_string;
use crate::error::Error;

use ::config::Config;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Builds a server-side TLS config from `tls_server_cert` / `tls_server_key`.
pub fn server_config(config: &Config, name: &str) -> Result<Arc<ServerConfig>, Error> {
    let cert_path = get_namespaced_string(config, name, "tls_server_cert")?;
    let key_path = get_namespaced_string(config, name, "tls_server_key")?;

    let cert_chain = load_certs(&cert_path)?;
    if cert_chain.is_empty() {
        return Err(Error::TlsInvalidMaterial(format!(
            "No certificates found in {cert_path}"
        )));
    }

    let key_file = File::open(&key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.clone(),
        source: e,
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidMaterial(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| {
            Error::TlsInvalidMaterial(format!("No private key found in {key_path}"))
        })?;

    let tls = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsInvalidMaterial(e.to_string()))?;

    Ok(Arc::new(tls))
}

/// Builds a client-side TLS config trusting the CA from `tls_ca_cert`.
pub fn client_config(config: &Config, name: &str) -> Result<Arc<ClientConfig>, Error> {
    let ca_path = get_namespaced_string(config, name, "tls_ca_cert")?;

    let ca_certs = load_certs(&ca_path)?;
    if ca_certs.is_empty() {
        return Err(Error::TlsInvalidMaterial(format!(
            "No CA certificates found in {ca_path}"
        )));
    }

    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidMaterial(e.to_string()))?;
    }

    let tls = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(tls))
}

/// Parses the SNI name handed to
/// [`Socket::set_secure_client`](crate::Socket::set_secure_client).
pub fn server_name(name: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(name.to_string())
        .map_err(|_| Error::TlsInvalidServerName(name.to_string()))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidMaterial(format!("Failed to parse certificates: {e}")))
}
