//! Daemon harness shared by the end-to-end tests

#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use memguarded_client::{ClientConfig, SecretClient};
use memguarded_common::store::SecretStore;
use memguarded_server::{SecretServer, ServerOptions};
use tempfile::TempDir;

pub struct TestDaemon {
    _dir:       TempDir,
    pub path:   PathBuf,
    pub server: SecretServer,
    handle:     Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with(|options| options)
    }

    pub fn start_with(configure: impl FnOnce(ServerOptions) -> ServerOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memguarded.sock");
        Self::start_at(dir, path, configure)
    }

    pub fn start_at(
        dir: TempDir,
        path: PathBuf,
        configure: impl FnOnce(ServerOptions) -> ServerOptions,
    ) -> Self {
        let options = configure(ServerOptions::new(&path));
        let server = SecretServer::new(options, Arc::new(SecretStore::new()));
        let listener = server.bind().unwrap();

        let handle = {
            let server = server.clone();
            thread::spawn(move || server.serve(listener))
        };

        Self {
            _dir: dir,
            path,
            server,
            handle: Some(handle),
        }
    }

    pub fn client(&self) -> SecretClient {
        SecretClient::new(self.client_config())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new()
            .with_socket_path(&self.path)
            .with_timeout(Duration::from_secs(5))
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        self.server.store()
    }

    /// Wait for the accept loop to return on its own
    pub fn join(&mut self) -> anyhow::Result<()> {
        self.handle.take().unwrap().join().unwrap()
    }

    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        self.server.stop();
        self.join()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.shutdown();
        }
    }
}

pub fn secret(bytes: &[u8]) -> SecretStore {
    let store = SecretStore::new();
    store.set_from_bytes(&mut bytes.to_vec()).unwrap();
    store
}

pub fn current_uid() -> u32 {
    // SAFETY: getuid() is always safe to call
    unsafe { libc::getuid() }
}
