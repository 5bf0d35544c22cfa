//! Loading of mutual TLS configurations from PEM files.

use std::{
    fs,
    io::{self, BufReader},
    path::Path,
    sync::Arc,
};

use pkcs8::{der::Document, EncryptedPrivateKeyInfo};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, private_key};
use zeroize::Zeroizing;

use crate::{
    config::{ClientCertPath, ServerCertPath},
    error::{MemguardedError, Result},
    store::SecretStore,
};

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

fn install_crypto_provider() {
    // fails when a provider is already installed, which is fine
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Server side of the channel: presents its certificate and requires a client
/// certificate signed by the configured CA.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig(Arc<ServerConfig>);

impl ServerTlsConfig {
    pub fn load(paths: &ServerCertPath) -> Result<Self> {
        install_crypto_provider();

        tracing::info!("Loading server TLS material:");
        tracing::info!("  - Server cert: {:?}", paths.cert_path);
        tracing::info!("  - Server key: {:?}", paths.key_path);
        tracing::info!("  - CA cert: {:?}", paths.ca_path);

        let cert_chain = load_certs(&paths.cert_path)?;
        let key = load_private_key(&paths.key_path, None)?;
        let roots = load_roots(&paths.ca_path)?;

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| MemguardedError::Tls(format!("building client verifier: {e}")))?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, key)
            .map_err(|e| MemguardedError::Tls(format!("server certificate rejected: {e}")))?;
        // no resumption: tickets written after the handshake would race a
        // client that sends its command and closes right away
        config.send_tls13_tickets = 0;

        Ok(Self(Arc::new(config)))
    }

    pub fn shared(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.0)
    }
}

/// Client side of the channel: verifies the server against the CA and
/// presents the client certificate.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig(Arc<ClientConfig>);

impl ClientTlsConfig {
    /// `passphrase` unlocks an `ENCRYPTED PRIVATE KEY`; it is never copied out
    /// of the store except for the duration of the decryption.
    pub fn load(paths: &ClientCertPath, passphrase: Option<&SecretStore>) -> Result<Self> {
        install_crypto_provider();

        tracing::debug!("Loading client TLS material from {:?}", paths.cert_path);

        let cert_chain = load_certs(&paths.cert_path)?;
        let key = load_private_key(&paths.key_path, passphrase)?;
        let roots = load_roots(&paths.ca_path)?;

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| MemguardedError::Tls(format!("client certificate rejected: {e}")))?;

        Ok(Self(Arc::new(config)))
    }

    pub fn shared(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.0)
    }
}

/// Whether the key at `path` needs a passphrase
pub fn is_key_encrypted(path: &Path) -> Result<bool> {
    let pem = read_pem(path)?;
    Ok(is_encrypted_pem(&pem))
}

/// Validate a DNS name the client should find in the server certificate
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| MemguardedError::Tls(format!("invalid server name `{name}`: {e}")))
}

fn read_pem(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    fs::read(path)
        .map(Zeroizing::new)
        .map_err(|e| MemguardedError::Tls(format!("reading {}: {e}", path.display())))
}

fn is_encrypted_pem(pem: &[u8]) -> bool {
    let marker = format!("-----BEGIN {ENCRYPTED_KEY_LABEL}-----");
    pem.windows(marker.len()).any(|w| w == marker.as_bytes())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    let chain = certs(&mut BufReader::new(&pem[..]))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| MemguardedError::Tls(format!("parsing {}: {e}", path.display())))?;

    if chain.is_empty() {
        return Err(MemguardedError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(load_certs(path)?);

    if roots.is_empty() {
        return Err(MemguardedError::Tls(format!(
            "no valid CA certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn load_private_key(
    path: &Path,
    passphrase: Option<&SecretStore>,
) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path)?;

    if is_encrypted_pem(&pem) {
        return decrypt_private_key(&pem, path, passphrase);
    }

    private_key(&mut BufReader::new(&pem[..]))
        .map_err(|e| MemguardedError::Tls(format!("parsing {}: {e}", path.display())))?
        .ok_or_else(|| MemguardedError::Tls(format!("no private key found in {}", path.display())))
}

fn decrypt_private_key(
    pem: &[u8],
    path: &Path,
    passphrase: Option<&SecretStore>,
) -> Result<PrivateKeyDer<'static>> {
    let store = passphrase.filter(|store| store.is_set()).ok_or_else(|| {
        MemguardedError::Tls(format!(
            "{} is encrypted and no passphrase was provided",
            path.display()
        ))
    })?;

    let pem = std::str::from_utf8(pem).map_err(|e| invalid_key(path, e))?;
    let (label, document) = Document::from_pem(pem).map_err(|e| invalid_key(path, e))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(invalid_key(path, format!("unexpected PEM label `{label}`")));
    }
    let encrypted =
        EncryptedPrivateKeyInfo::try_from(document.as_bytes()).map_err(|e| invalid_key(path, e))?;

    let passphrase = store.open()?;
    let decrypted = encrypted.decrypt(passphrase.bytes()).map_err(|e| {
        MemguardedError::Tls(format!("decrypting {}: {e}", path.display()))
    })?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

fn invalid_key(path: &Path, e: impl std::fmt::Display) -> MemguardedError {
    MemguardedError::Tls(format!("parsing {}: {e}", path.display()))
}
