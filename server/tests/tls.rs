//! End-to-end tests over mutual TLS, with a throwaway PKI generated per test.

mod support;

use std::{fs, path::Path};

use memguarded_client::{ClientTransport, MemguardedError, SecretClient};
use memguarded_common::{
    store::SecretStore,
    tls::{server_name, ClientTlsConfig, ServerTlsConfig},
    ClientCertPath, ServerCertPath,
};
use memguarded_server::{PeerAuthenticator, ServerOptions, Transport};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use support::{current_uid, secret, TestDaemon};
use tempfile::TempDir;

struct Authority {
    cert: Certificate,
    key:  KeyPair,
}

impl Authority {
    fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// Issue a leaf for `name`, written as `<stem>.pem` and `<stem>.key.pem`
    fn issue(&self, dir: &Path, stem: &str, name: &str, usage: ExtendedKeyUsagePurpose) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{stem}.pem")), cert.pem()).unwrap();
        fs::write(dir.join(format!("{stem}.key.pem")), key.serialize_pem()).unwrap();
    }

    fn write_root(&self, path: &Path) {
        fs::write(path, self.cert.pem()).unwrap();
    }
}

/// CA, server and client material in the default directory layout
struct Pki {
    dir: TempDir,
}

impl Pki {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca = Authority::new("memguarded test CA");
        ca.write_root(&dir.path().join("root-ca.pem"));
        ca.issue(
            &dir.path().join("server"),
            "server",
            "memguarded",
            ExtendedKeyUsagePurpose::ServerAuth,
        );
        ca.issue(
            &dir.path().join("client"),
            "client",
            "memguarded-client",
            ExtendedKeyUsagePurpose::ClientAuth,
        );
        Self { dir }
    }

    fn server(&self) -> Transport {
        Transport::Tls(ServerTlsConfig::load(&ServerCertPath::in_dir(self.dir.path())).unwrap())
    }

    fn client(&self) -> ClientTransport {
        self.client_with(ClientCertPath::in_dir(self.dir.path()))
    }

    /// Client certificate from an unrelated CA, still trusting the real server
    fn rogue_client(&self) -> ClientTransport {
        let rogue = self.dir.path().join("rogue");
        Authority::new("rogue CA").issue(
            &rogue,
            "client",
            "memguarded-client",
            ExtendedKeyUsagePurpose::ClientAuth,
        );
        self.client_with(ClientCertPath {
            cert_path: rogue.join("client.pem"),
            key_path:  rogue.join("client.key.pem"),
            ca_path:   self.dir.path().join("root-ca.pem"),
        })
    }

    fn client_with(&self, paths: ClientCertPath) -> ClientTransport {
        ClientTransport::tls(ClientTlsConfig::load(&paths, None).unwrap()).unwrap()
    }
}

fn tls_daemon(pki: &Pki, strict: bool) -> TestDaemon {
    let transport = pki.server();
    TestDaemon::start_with(move |mut options: ServerOptions| {
        options.transport = transport;
        options.stop_on_any_client_error = strict;
        options
    })
}

fn tls_client(daemon: &TestDaemon, transport: ClientTransport) -> SecretClient {
    SecretClient::new(daemon.client_config().with_transport(transport))
}

#[test]
fn secret_round_trips_over_mutual_tls() {
    let pki = Pki::new();
    let mut daemon = tls_daemon(&pki, true);

    let mut writer = tls_client(&daemon, pki.client());
    writer.dial().unwrap();
    writer.set_secret(&secret(b"hunter2")).unwrap();
    writer.close();

    let mut reader = tls_client(&daemon, pki.client());
    reader.dial().unwrap();
    let fetched = SecretStore::new();
    reader.get_secret(&fetched).unwrap();
    assert_eq!(fetched.open().unwrap().bytes(), b"hunter2");
    reader.close();

    daemon.shutdown().unwrap();
}

#[test]
fn close_right_after_set_keeps_every_secret() {
    let pki = Pki::new();
    let mut daemon = tls_daemon(&pki, true);

    for round in 0..10 {
        let value = format!("secret-{round}");
        let mut client = tls_client(&daemon, pki.client());
        client.dial().unwrap();
        client.set_secret(&secret(value.as_bytes())).unwrap();
        client.close();

        assert_eq!(daemon.store().open().unwrap().bytes(), value.as_bytes());
    }

    daemon.shutdown().unwrap();
}

#[test]
fn idle_client_closes_cleanly() {
    let pki = Pki::new();
    let mut daemon = tls_daemon(&pki, true);

    for _ in 0..5 {
        let mut client = tls_client(&daemon, pki.client());
        client.dial().unwrap();
        client.close();
    }
    // dropping without an explicit close goes through the same path
    let mut dropped = tls_client(&daemon, pki.client());
    dropped.dial().unwrap();
    drop(dropped);

    assert!(!daemon.server.is_stopping());
    daemon.shutdown().unwrap();
}

#[test]
fn client_certificate_from_another_ca_is_rejected() {
    let pki = Pki::new();
    let daemon = tls_daemon(&pki, false);

    let mut rogue = tls_client(&daemon, pki.rogue_client());
    // the server judges the certificate after the client's last flight, so the
    // rejection can surface on dial or on the first command
    let err = rogue
        .dial()
        .and_then(|_| rogue.get_secret(&SecretStore::new()))
        .unwrap_err();
    assert!(matches!(err.root(), MemguardedError::HandshakeFailed(_)), "{err}");

    let mut trusted = tls_client(&daemon, pki.client());
    trusted.dial().unwrap();
    trusted.set_secret(&secret(b"hunter2")).unwrap();
    trusted.close();
    assert_eq!(daemon.store().open().unwrap().bytes(), b"hunter2");
}

#[test]
fn unexpected_server_name_fails_the_dial() {
    let pki = Pki::new();
    let daemon = tls_daemon(&pki, false);

    let transport = match pki.client() {
        ClientTransport::Tls { config, .. } => ClientTransport::Tls {
            config,
            server_name: server_name("someone-else").unwrap(),
        },
        ClientTransport::Plain => unreachable!(),
    };
    let mut client = tls_client(&daemon, transport);
    let err = client.dial().unwrap_err();

    assert!(matches!(err.root(), MemguardedError::HandshakeFailed(_)), "{err}");
    assert!(!client.is_connected());
}

#[test]
fn peer_uid_is_still_checked_behind_tls() {
    let pki = Pki::new();
    let transport = pki.server();
    let daemon = TestDaemon::start_with(move |mut options| {
        options.transport = transport;
        options.authenticator = PeerAuthenticator::with_expected_uid(current_uid().wrapping_add(1));
        options
    });

    let mut client = tls_client(&daemon, pki.client());
    let rejected = client
        .dial()
        .and_then(|_| client.set_secret(&secret(b"hunter2")))
        .and_then(|_| client.get_secret(&SecretStore::new()));

    assert!(rejected.is_err());
    assert!(!daemon.store().is_set());
}
