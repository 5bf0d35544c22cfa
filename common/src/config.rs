use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Socket the daemon listens on unless configured otherwise
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/memguarded.sock";

/// Per-operation deadline, both sides
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Name the client expects in the server certificate
pub const DEFAULT_SERVER_NAME: &str = "memguarded";

/// Environment variable holding the shared gate password
pub const SOCKET_PASSWORD_ENV: &str = "MEMGUARDED_SOCKET_PASSWORD";

/// Environment variable holding the client key passphrase
pub const CERT_PASSPHRASE_ENV: &str = "MEMGUARDED_CERT_PASSPHRASE";

const CERTS_DIR_ENV: &str = "MEMGUARDED_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const SERVER_CERTS_SUBDIR: &str = "server";
const CLIENT_CERTS_SUBDIR: &str = "client";

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Server certificate paths for TLS authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCertPath {
    /// Path to the server certificate chain
    pub cert_path: PathBuf,
    /// Path to the server private key
    pub key_path:  PathBuf,
    /// Path to the CA that signs client certificates
    pub ca_path:   PathBuf,
}

impl ServerCertPath {
    /// Default locations under `$MEMGUARDED_CERTS_DIR` (or `certs`)
    pub fn new() -> Self {
        Self::in_dir(&get_certs_dir())
    }

    /// Certificates in `base/server`, CA in `base`
    pub fn in_dir(base: &Path) -> Self {
        let dir = base.join(SERVER_CERTS_SUBDIR);
        Self {
            cert_path: dir.join("server.pem"),
            key_path:  dir.join("server.key.pem"),
            ca_path:   base.join("root-ca.pem"),
        }
    }
}

impl Default for ServerCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate paths for client authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCertPath {
    /// Path to the client certificate chain
    pub cert_path: PathBuf,
    /// Path to the client private key, optionally encrypted
    pub key_path:  PathBuf,
    /// Path to the CA that signs the server certificate
    pub ca_path:   PathBuf,
}

impl ClientCertPath {
    /// Default locations under `$MEMGUARDED_CERTS_DIR` (or `certs`)
    pub fn new() -> Self {
        Self::in_dir(&get_certs_dir())
    }

    /// Certificates in `base/client`, CA in `base`
    pub fn in_dir(base: &Path) -> Self {
        let dir = base.join(CLIENT_CERTS_SUBDIR);
        Self {
            cert_path: dir.join("client.pem"),
            key_path:  dir.join("client.key.pem"),
            ca_path:   base.join("root-ca.pem"),
        }
    }
}

impl Default for ClientCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutual TLS material for both ends of the channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub server: ServerCertPath,
    pub client: ClientCertPath,
}

/// Settings shared by the daemon and the client, loaded from a JSON file.
/// Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub socket_path: PathBuf,
    pub timeout_secs: u64,
    pub stop_on_any_client_error: bool,
    /// Plain channel when absent
    pub tls: Option<TlsSettings>,
    /// Environment variable the gate password is read from
    pub socket_password_env: String,
    pub server_name: String,
    /// Hex SHA-256 digests of executables allowed to connect. Empty disables
    /// executable pinning.
    pub allowed_client_hashes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stop_on_any_client_error: false,
            tls: None,
            socket_password_env: SOCKET_PASSWORD_ENV.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            allowed_client_hashes: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw).context("Failed to parse settings")?;
        if settings.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than zero");
        }
        Ok(settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Shared gate password from the configured environment variable; unset
    /// or empty means no gate.
    pub fn socket_password(&self) -> Option<Zeroizing<String>> {
        env::var(&self.socket_password_env)
            .ok()
            .filter(|value| !value.is_empty())
            .map(Zeroizing::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::from_json("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.socket_path, PathBuf::from("/tmp/memguarded.sock"));
        assert_eq!(settings.timeout(), Duration::from_secs(10));
        assert!(settings.tls.is_none());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let settings = Settings::from_json(
            r#"{
                "socket_path": "/run/user/1000/memguarded.sock",
                "stop_on_any_client_error": true,
                "allowed_client_hashes": ["abc123"]
            }"#,
        )
        .unwrap();

        assert_eq!(settings.socket_path, PathBuf::from("/run/user/1000/memguarded.sock"));
        assert!(settings.stop_on_any_client_error);
        assert_eq!(settings.allowed_client_hashes, vec!["abc123".to_string()]);
        assert_eq!(settings.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn tls_paths_can_be_given_individually() {
        let settings = Settings::from_json(
            r#"{ "tls": { "client": { "key_path": "/keys/client.key.pem" } } }"#,
        )
        .unwrap();

        let tls = settings.tls.unwrap();
        assert_eq!(tls.client.key_path, PathBuf::from("/keys/client.key.pem"));
        assert!(tls.client.cert_path.ends_with("client/client.pem"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Settings::from_json(r#"{ "timeout_secs": 0 }"#).is_err());
    }

    #[test]
    fn cert_paths_follow_directory_layout() {
        let server = ServerCertPath::in_dir(Path::new("/etc/memguarded"));
        assert_eq!(server.cert_path, PathBuf::from("/etc/memguarded/server/server.pem"));
        assert_eq!(server.ca_path, PathBuf::from("/etc/memguarded/root-ca.pem"));

        let client = ClientCertPath::in_dir(Path::new("/etc/memguarded"));
        assert_eq!(client.key_path, PathBuf::from("/etc/memguarded/client/client.key.pem"));
        assert_eq!(client.ca_path, server.ca_path);
    }

    #[test]
    fn socket_password_reads_configured_variable() {
        let settings = Settings {
            socket_password_env: "MEMGUARDED_TEST_GATE_PASSWORD_UNSET".to_string(),
            ..Settings::default()
        };
        assert!(settings.socket_password().is_none());
    }
}
