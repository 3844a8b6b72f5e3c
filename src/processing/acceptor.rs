//! Acceptor: turns every client of a listening endpoint into a feeder

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::runtime::Handle;

use super::feeder::Feeder;
use crate::io::Endpoint;
use crate::multiplexing::{Engine, MuxerFilter};

const SLEEP_STEP: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

struct Inner {
    name: String,
    endpoint: Arc<dyn Endpoint>,
    engine: Arc<Engine>,
    read_filter: MuxerFilter,
    write_filter: MuxerFilter,
    runtime: Handle,
    retry_interval: Mutex<Duration>,
    feeders: Mutex<Vec<Arc<Feeder>>>,
    next_feeder_id: AtomicU64,
    should_exit: AtomicBool,
}

/// Accept loop of one listening endpoint
pub struct Acceptor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    pub fn new(
        name: impl Into<String>,
        endpoint: Arc<dyn Endpoint>,
        engine: &Arc<Engine>,
        read_filter: MuxerFilter,
        write_filter: MuxerFilter,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                endpoint,
                engine: Arc::clone(engine),
                read_filter,
                write_filter,
                runtime,
                retry_interval: Mutex::new(DEFAULT_RETRY_INTERVAL),
                feeders: Mutex::new(Vec::new()),
                next_feeder_id: AtomicU64::new(1),
                should_exit: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Delay before accepting again after the endpoint failed
    pub fn set_retry_interval(&self, retry_interval: Duration) {
        *self.inner.retry_interval.lock() = retry_interval;
    }

    /// Start accepting; does nothing if already started
    pub fn start(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        self.inner.should_exit.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        match std::thread::Builder::new()
            .name("proc_acceptor".into())
            .spawn(move || inner.run())
        {
            Ok(handle) => {
                tracing::info!(acceptor = %self.inner.name, "Acceptor started");
                *thread = Some(handle);
            }
            Err(e) => tracing::error!(
                acceptor = %self.inner.name,
                error = %e,
                "Cannot spawn acceptor thread"
            ),
        }
    }

    /// Stop accepting, stop every feeder and wait for the thread
    pub fn exit(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.inner.should_exit.store(true, Ordering::Release);
        if handle.join().is_err() {
            tracing::error!(acceptor = %self.inner.name, "Acceptor thread panicked");
        }
    }

    /// Number of live feeders
    pub fn feeder_count(&self) -> usize {
        self.inner.prune();
        self.inner.feeders.lock().len()
    }

    /// Merge the statistics of every live feeder into `tree`
    pub fn statistics(&self, tree: &mut Map<String, Value>) {
        let feeders = self.inner.feeders.lock().clone();
        let mut peers = Map::new();
        for feeder in feeders.iter().filter(|f| !f.is_finished()) {
            let mut sub = Map::new();
            feeder.statistics(&mut sub);
            peers.insert(feeder.name().to_string(), Value::Object(sub));
        }
        tree.insert("peers".into(), peers.len().into());
        tree.insert("feeders".into(), Value::Object(peers));
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.exit();
    }
}

impl Inner {
    fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    fn prune(&self) {
        self.feeders.lock().retain(|f| !f.is_finished());
    }

    fn run(self: Arc<Self>) {
        while !self.should_exit() {
            self.prune();

            match self.endpoint.open() {
                Ok(Some(stream)) => {
                    let id = self.next_feeder_id.fetch_add(1, Ordering::Relaxed);
                    let name = format!("{}-{}", self.name, id);
                    tracing::debug!(acceptor = %self.name, feeder = %name, "New incoming connection");
                    match Feeder::create(
                        name,
                        &self.engine,
                        stream,
                        self.read_filter.clone(),
                        self.write_filter.clone(),
                        self.runtime.clone(),
                    ) {
                        Ok(feeder) => self.feeders.lock().push(feeder),
                        Err(e) => tracing::error!(
                            acceptor = %self.name,
                            error = %e,
                            "Cannot create feeder"
                        ),
                    }
                }
                Ok(None) => std::thread::sleep(SLEEP_STEP),
                Err(e) => {
                    tracing::error!(acceptor = %self.name, error = %e, "Failed to accept connection");
                    let retry_interval = *self.retry_interval.lock();
                    let started = Instant::now();
                    while started.elapsed() < retry_interval && !self.should_exit() {
                        std::thread::sleep(SLEEP_STEP.min(retry_interval));
                    }
                }
            }
        }

        let feeders: Vec<Arc<Feeder>> = self.feeders.lock().drain(..).collect();
        tracing::info!(
            acceptor = %self.name,
            feeders = feeders.len(),
            "Acceptor exiting, stopping feeders"
        );
        for feeder in feeders {
            feeder.stop();
        }
    }
}
