//! Fail-together service group.
//!
//! Every member runs on its own thread. The first member to return, whether it
//! succeeded or failed, makes the group stop all members.

use std::{sync::Arc, thread};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use memguarded_common::store::SecretStore;

/// A long-running member of a [`ServiceGroup`]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Run until finished or stopped
    fn start(&self) -> Result<()>;

    /// Ask [`Service::start`] to return. Safe to call more than once, and
    /// before `start`.
    fn stop(&self, cause: Option<&anyhow::Error>);
}

#[derive(Default)]
pub struct ServiceGroup {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Run every member and return the first error, once all members returned
    pub fn run(self) -> Result<()> {
        if self.services.is_empty() {
            return Ok(());
        }

        let (done_tx, done_rx) = unbounded::<(usize, Result<()>)>();
        let mut handles = Vec::with_capacity(self.services.len());

        for (index, service) in self.services.iter().enumerate() {
            let service = Arc::clone(service);
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("service-{}", service.name()))
                .spawn(move || {
                    tracing::debug!("Starting service {}", service.name());
                    let result = service.start();
                    let _ = done_tx.send((index, result));
                });

            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    let e = anyhow!(e).context("Failed to spawn service thread");
                    self.stop_all(Some(&e));
                    join_all(handles);
                    return Err(e);
                }
            }
        }
        drop(done_tx);

        let (first, result) = done_rx
            .recv()
            .context("Service threads exited without reporting")?;
        match &result {
            Ok(()) => tracing::info!(
                "Service {} finished, stopping group",
                self.services[first].name()
            ),
            Err(e) => tracing::error!("Service {} failed: {:#}", self.services[first].name(), e),
        }

        self.stop_all(result.as_ref().err());

        let mut first_error = result.err();
        for (index, result) in done_rx.iter() {
            if let Err(e) = result {
                tracing::warn!(
                    "Service {} failed while stopping: {:#}",
                    self.services[index].name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        join_all(handles);

        first_error.map_or(Ok(()), Err)
    }

    fn stop_all(&self, cause: Option<&anyhow::Error>) {
        for service in &self.services {
            tracing::debug!("Stopping service {}", service.name());
            service.stop(cause);
        }
    }
}

fn join_all(handles: Vec<thread::JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("Service thread panicked");
        }
    }
}

/// Single-fire stop request
#[derive(Debug, Clone)]
struct StopSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl StopSignal {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    fn fire(&self) {
        // full means already fired
        let _ = self.tx.try_send(());
    }
}

/// Returns when SIGINT or SIGTERM arrives, or when stopped
#[derive(Debug)]
pub struct SigtermService {
    signals: Receiver<()>,
    stop:    StopSignal,
}

impl SigtermService {
    /// Install the process signal handler. Only one handler can exist per
    /// process.
    pub fn new() -> Result<Self> {
        let (tx, rx) = bounded(1);
        ctrlc::set_handler(move || {
            let _ = tx.try_send(());
        })
        .context("Failed to set signal handler")?;
        Ok(Self::from_receiver(rx))
    }

    /// Watch an arbitrary notification channel instead of process signals
    pub fn from_receiver(signals: Receiver<()>) -> Self {
        Self {
            signals,
            stop: StopSignal::new(),
        }
    }
}

impl Service for SigtermService {
    fn name(&self) -> &str {
        "sigterm"
    }

    fn start(&self) -> Result<()> {
        select! {
            recv(self.signals) -> _ => tracing::info!("Received shutdown signal, stopping..."),
            recv(self.stop.rx) -> _ => tracing::debug!("Signal watcher stopped"),
        }
        Ok(())
    }

    fn stop(&self, _cause: Option<&anyhow::Error>) {
        self.stop.fire();
    }
}

/// Owns the daemon's secret for the lifetime of the group and purges it on stop
#[derive(Debug)]
pub struct StoreService {
    store: Arc<SecretStore>,
    stop:  StopSignal,
}

impl StoreService {
    pub fn new(store: Arc<SecretStore>) -> Self {
        Self {
            store,
            stop: StopSignal::new(),
        }
    }

}

impl Service for StoreService {
    fn name(&self) -> &str {
        "store"
    }

    fn start(&self) -> Result<()> {
        // a disconnect cannot happen, the service owns a sender
        let _ = self.stop.rx.recv();
        self.store.purge();
        tracing::info!("✓ Secret store purged");
        Ok(())
    }

    fn stop(&self, _cause: Option<&anyhow::Error>) {
        self.store.purge();
        self.stop.fire();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    /// Blocks until stopped, counting stop calls
    struct Blocking {
        stop:  StopSignal,
        stops: AtomicUsize,
    }

    impl Blocking {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stop:  StopSignal::new(),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl Service for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }

        fn start(&self) -> Result<()> {
            let _ = self.stop.rx.recv();
            Ok(())
        }

        fn stop(&self, _cause: Option<&anyhow::Error>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stop.fire();
        }
    }

    struct Failing;

    impl Service for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn start(&self) -> Result<()> {
            thread::sleep(Duration::from_millis(20));
            Err(anyhow!("listener exploded"))
        }

        fn stop(&self, _cause: Option<&anyhow::Error>) {}
    }

    #[test]
    fn empty_group_returns_immediately() {
        ServiceGroup::new().run().unwrap();
    }

    #[test]
    fn first_failure_stops_everyone_and_is_returned() {
        let a = Blocking::new();
        let b = Blocking::new();

        let err = ServiceGroup::new()
            .with(a.clone())
            .with(Arc::new(Failing))
            .with(b.clone())
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("listener exploded"));
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_stops_the_group_cleanly() {
        let (tx, rx) = bounded(1);
        let blocking = Blocking::new();
        let group = ServiceGroup::new()
            .with(Arc::new(SigtermService::from_receiver(rx)))
            .with(blocking.clone());

        let runner = thread::spawn(move || group.run());
        tx.send(()).unwrap();

        runner.join().unwrap().unwrap();
        assert_eq!(blocking.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sigterm_stop_is_idempotent_and_may_precede_start() {
        let (_tx, rx) = bounded(1);
        let service = SigtermService::from_receiver(rx);
        service.stop(None);
        service.stop(None);
        service.start().unwrap();
    }

    #[test]
    fn store_service_purges_on_stop() {
        let store = Arc::new(SecretStore::new());
        store.set_from_bytes(&mut b"hunter2".to_vec()).unwrap();

        let (tx, rx) = bounded(1);
        let service = Arc::new(StoreService::new(Arc::clone(&store)));
        let group = ServiceGroup::new()
            .with(Arc::new(SigtermService::from_receiver(rx)))
            .with(service);

        tx.send(()).unwrap();
        group.run().unwrap();
        assert!(!store.is_set());
    }
}
