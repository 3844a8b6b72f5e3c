//! Failover: supervised connection to an output endpoint
//!
//! A failover owns a dedicated thread that keeps a stream to its endpoint
//! open, pumps events both ways between that stream and its muxer, and
//! reconnects after every failure. While the primary is down it can run a
//! nested failover on the same muxer as a stand-in; once the primary is back
//! the stand-in is shut down and unacknowledged events are replayed.
//!
//! Events written to the primary are also copied to every secondary stream
//! opened for the current connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};

use crate::io::{Deadline, Endpoint, ReadOutcome, Stream, StreamError};
use crate::multiplexing::Muxer;
use crate::stats::{self, ConnectionState, EndpointStats};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);
/// Granularity of every wait, bounding the reaction time to `exit()`
const SLEEP_STEP: Duration = Duration::from_millis(100);
const IDLE_WAIT: Duration = Duration::from_millis(10);
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const QUEUED_EVENTS_INTERVAL: Duration = Duration::from_secs(5);
const STATS_LOCK_WAIT: Duration = Duration::from_millis(100);

/// Failover thread lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    NotStarted,
    Running,
    Stopped,
}

struct Settings {
    retry_interval: Duration,
    buffering_timeout: Duration,
}

struct Inner {
    name: String,
    endpoint: Arc<dyn Endpoint>,
    muxer: Arc<Muxer>,
    secondaries: Mutex<Vec<Arc<dyn Endpoint>>>,
    failover: Mutex<Option<Arc<Failover>>>,
    settings: Mutex<Settings>,

    state: Mutex<FailoverState>,
    state_cv: Condvar,
    should_exit: AtomicBool,
    update_requested: AtomicBool,
    initialized: AtomicBool,
    failover_launched: AtomicBool,

    stream: Mutex<Option<Box<dyn Stream>>>,
    stats: Mutex<EndpointStats>,
}

/// Supervised, reconnecting connection to one endpoint
pub struct Failover {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Failover {
    pub fn new(name: impl Into<String>, endpoint: Arc<dyn Endpoint>, muxer: Arc<Muxer>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                stats: Mutex::new(EndpointStats::new(name.clone())),
                name,
                endpoint,
                muxer,
                secondaries: Mutex::new(Vec::new()),
                failover: Mutex::new(None),
                settings: Mutex::new(Settings {
                    retry_interval: DEFAULT_RETRY_INTERVAL,
                    buffering_timeout: Duration::ZERO,
                }),
                state: Mutex::new(FailoverState::NotStarted),
                state_cv: Condvar::new(),
                should_exit: AtomicBool::new(false),
                update_requested: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                failover_launched: AtomicBool::new(false),
                stream: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn muxer(&self) -> &Arc<Muxer> {
        &self.inner.muxer
    }

    pub fn set_retry_interval(&self, retry_interval: Duration) {
        self.inner.settings.lock().retry_interval = retry_interval;
    }

    /// Delay between a successful connection and the first delivery
    pub fn set_buffering_timeout(&self, buffering_timeout: Duration) {
        self.inner.settings.lock().buffering_timeout = buffering_timeout;
    }

    /// Failover run on the same muxer while this one is disconnected
    pub fn set_failover(&self, failover: Arc<Failover>) {
        *self.inner.failover.lock() = Some(failover);
    }

    /// Add a mirror endpoint
    ///
    /// The muxer write filter is widened with the types the endpoint's
    /// streams need and narrowed by the types they must not receive.
    pub fn add_secondary_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let mut filter = self.inner.muxer.write_filter();
        filter |= &endpoint.stream_mandatory_filter();
        filter -= &endpoint.stream_forbidden_filter();
        self.inner.muxer.set_write_filter(filter);
        self.inner.secondaries.lock().push(endpoint);
    }

    pub fn state(&self) -> FailoverState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == FailoverState::Running
    }

    /// Whether the first connection attempt completed, successful or not
    pub fn get_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Start the failover thread; returns once it runs
    ///
    /// Does nothing if the thread is already running.
    pub fn start(&self) {
        let mut thread = self.thread.lock();
        if let Some(handle) = thread.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                tracing::error!(failover = %self.inner.name, "Previous failover thread panicked");
            }
        }

        self.inner.should_exit.store(false, Ordering::Release);
        *self.inner.state.lock() = FailoverState::NotStarted;

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("proc_failover".into())
            .spawn(move || inner.run());
        match spawned {
            Ok(handle) => *thread = Some(handle),
            Err(e) => {
                tracing::error!(
                    failover = %self.inner.name,
                    error = %e,
                    "Cannot spawn failover thread"
                );
                *self.inner.state.lock() = FailoverState::Stopped;
                return;
            }
        }

        let mut state = self.inner.state.lock();
        while *state == FailoverState::NotStarted {
            self.inner.state_cv.wait(&mut state);
        }
        tracing::debug!(failover = %self.inner.name, "Failover started");
    }

    /// Ask the thread to stop and wait until it has
    pub fn exit(&self) {
        let mut thread = self.thread.lock();
        let Some(handle) = thread.take() else {
            return;
        };

        tracing::debug!(failover = %self.inner.name, "Failover exit requested");
        self.inner.should_exit.store(true, Ordering::Release);
        self.inner.muxer.wake();

        {
            let mut state = self.inner.state.lock();
            while *state != FailoverState::Stopped && !handle.is_finished() {
                self.inner.state_cv.wait_for(&mut state, SLEEP_STEP);
            }
        }
        if handle.join().is_err() {
            tracing::error!(failover = %self.inner.name, "Failover thread panicked");
        }
    }

    /// Ask the current stream (and the nested failover) to reload its
    /// configuration on the next loop turn
    pub fn update(&self) {
        self.inner.update_requested.store(true, Ordering::Release);
        if let Some(failover) = self.inner.failover.lock().as_ref() {
            failover.update();
        }
    }

    /// Latest statistics snapshot
    pub fn stats(&self) -> EndpointStats {
        self.inner.stats.lock().clone()
    }

    /// Merge failover, stream, muxer and nested failover statistics into
    /// `tree`
    pub fn statistics(&self, tree: &mut Map<String, Value>) {
        stats::merge(&*self.inner.stats.lock(), tree);

        match self.inner.stream.try_lock_for(STATS_LOCK_WAIT) {
            Some(stream) => {
                if let Some(stream) = stream.as_ref() {
                    stream.statistics(tree);
                }
            }
            None => {
                tree.insert("stream_status".into(), "busy".into());
            }
        }

        let mut muxer = Map::new();
        self.inner.muxer.statistics(&mut muxer);
        tree.insert("muxer".into(), Value::Object(muxer));

        if let Some(failover) = self.inner.failover.lock().as_ref() {
            let mut sub = Map::new();
            failover.statistics(&mut sub);
            tree.insert("failover".into(), Value::Object(sub));
        }
    }
}

impl Drop for Failover {
    fn drop(&mut self) {
        self.exit();
    }
}

impl Inner {
    fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    fn set_state(&self, state: FailoverState) {
        *self.state.lock() = state;
        self.state_cv.notify_all();
    }

    fn set_status(&self, status: &str) {
        self.stats.lock().status = status.to_string();
    }

    fn run(self: Arc<Self>) {
        self.set_state(FailoverState::Running);
        tracing::info!(failover = %self.name, "Failover thread started");

        while !self.should_exit() {
            match self.run_connection() {
                Ok(()) => {}
                Err(StreamError::ConnectionClosed) | Err(StreamError::Shutdown) => {
                    tracing::info!(failover = %self.name, "Connection closed");
                    self.stats.lock().last_error.clear();
                }
                Err(e) => {
                    tracing::error!(failover = %self.name, error = %e, "Failover error");
                    self.stats.lock().last_error = e.to_string();
                }
            }

            self.clear_stream();
            self.stats.lock().state = ConnectionState::Connecting;
            if self.should_exit() {
                break;
            }

            self.launch_failover();
            self.initialized.store(true, Ordering::Release);

            self.set_status("sleeping before reconnection");
            let retry_interval = self.settings.lock().retry_interval;
            let started = Instant::now();
            while started.elapsed() < retry_interval
                && !self.should_exit()
                && !self.endpoint.is_ready()
            {
                std::thread::sleep(SLEEP_STEP.min(retry_interval));
            }
            self.set_status("");
        }

        self.clear_stream();
        let failover = self.failover.lock().clone();
        if let Some(failover) = failover {
            tracing::info!(failover = %self.name, "Requesting termination of nested failover");
            failover.exit();
        }
        self.stats.lock().state = ConnectionState::Disconnected;

        tracing::debug!(failover = %self.name, "Failover thread exiting");
        self.set_state(FailoverState::Stopped);
    }

    /// One connection: open, prepare, then pump until an error or exit
    fn run_connection(&self) -> Result<(), StreamError> {
        self.set_status("opening endpoint");
        self.stats.lock().set_last_connection_attempt();
        let stream = self
            .endpoint
            .open()?
            .ok_or_else(|| StreamError::failed(format!("'{}' cannot connect endpoint", self.name)))?;
        *self.stream.lock() = Some(stream);
        // A new stream always picks up the current configuration
        self.update_requested.store(true, Ordering::Release);
        {
            let mut stats = self.stats.lock();
            stats.state = ConnectionState::Connected;
            stats.set_last_connection_success();
        }
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(failover = %self.name, "Stream connected");
        self.set_status("");

        let buffering_timeout = self.settings.lock().buffering_timeout;
        if !buffering_timeout.is_zero() {
            tracing::debug!(
                failover = %self.name,
                buffering_secs = buffering_timeout.as_secs(),
                "Buffering data"
            );
            self.set_status("buffering data");
            let started = Instant::now();
            while started.elapsed() < buffering_timeout && !self.should_exit() {
                std::thread::sleep(SLEEP_STEP);
            }
            self.set_status("");
        }

        self.set_status("initializing secondaries");
        let mut secondaries = self.open_secondaries();
        self.set_status("");

        if self.failover_launched.swap(false, Ordering::AcqRel) {
            let failover = self.failover.lock().clone();
            if let Some(failover) = failover {
                tracing::debug!(failover = %self.name, "Shutting down nested failover");
                self.set_status("shutting down failover");
                failover.exit();
                self.set_status("");
            }
        }

        tracing::debug!(failover = %self.name, "Launching event loop");
        self.muxer.nack_events();
        self.event_loop(&mut secondaries)
    }

    fn open_secondaries(&self) -> Vec<Box<dyn Stream>> {
        let endpoints = self.secondaries.lock().clone();
        let mut streams = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match endpoint.open() {
                Ok(Some(stream)) => streams.push(stream),
                Ok(None) => tracing::error!(
                    failover = %self.name,
                    "Could not open a secondary: no stream returned"
                ),
                Err(e) => tracing::error!(
                    failover = %self.name,
                    error = %e,
                    "Error while opening a secondary"
                ),
            }
        }
        streams
    }

    fn event_loop(&self, secondaries: &mut Vec<Box<dyn Stream>>) -> Result<(), StreamError> {
        let mut stream_can_read = true;
        let mut muxer_can_read = true;
        let mut should_commit = false;
        let mut last_flush = Instant::now();
        let mut last_queued: Option<Instant> = None;

        while !self.should_exit() {
            if self.update_requested.swap(false, Ordering::AcqRel) {
                if let Some(stream) = self.stream.lock().as_mut() {
                    stream.update();
                }
            }

            if last_queued.map_or(true, |at| at.elapsed() >= QUEUED_EVENTS_INTERVAL) {
                last_queued = Some(Instant::now());
                self.stats.lock().queued_events = self.muxer.get_event_queue_size();
            }

            // Stream → engine, with priority
            if stream_can_read {
                match self.with_stream(|s| s.read(Deadline::Immediate)) {
                    Ok(ReadOutcome::Event(event)) => {
                        self.muxer.write(event);
                        continue;
                    }
                    Ok(_) => {}
                    Err(StreamError::Shutdown) => {
                        tracing::debug!(failover = %self.name, "Stream shut down while reading");
                        stream_can_read = false;
                    }
                    Err(e) => return Err(e),
                }
            }

            // Muxer → stream
            let mut muxer_idle = true;
            if muxer_can_read {
                if let ReadOutcome::Event(event) = self.muxer.read(Deadline::Immediate) {
                    muxer_idle = false;
                    should_commit = true;
                    tracing::trace!(
                        failover = %self.name,
                        event_type = %event.event_type(),
                        "Writing event to stream"
                    );

                    let acknowledged = match self.with_stream(|s| s.write(&event)) {
                        Ok(n) => n,
                        Err(StreamError::Shutdown) => {
                            tracing::debug!(failover = %self.name, "Stream shut down while writing");
                            muxer_can_read = false;
                            0
                        }
                        Err(e) => return Err(e),
                    };
                    self.muxer.ack_events(acknowledged);

                    secondaries.retain_mut(|secondary| match secondary.write(&event) {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::error!(
                                failover = %self.name,
                                error = %e,
                                "Error while writing to a secondary, removing it"
                            );
                            false
                        }
                    });
                }
            }

            if muxer_idle {
                if should_commit || last_flush.elapsed() >= FLUSH_INTERVAL {
                    should_commit = false;
                    last_flush = Instant::now();
                    let acknowledged = self.with_stream(|s| s.flush())?;
                    self.muxer.ack_events(acknowledged);
                }
                std::thread::sleep(IDLE_WAIT);
            }
        }
        Ok(())
    }

    fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn Stream>) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let mut stream = self.stream.lock();
        match stream.as_mut() {
            Some(s) => f(s),
            None => Err(StreamError::failed("no stream")),
        }
    }

    /// Stop and release the current stream, acknowledging what it confirms
    fn clear_stream(&self) {
        let stream = self.stream.lock().take();
        if let Some(mut stream) = stream {
            self.set_status("stopping stream");
            match stream.stop() {
                Ok(acknowledged) => {
                    self.muxer.ack_events(acknowledged);
                }
                Err(e) => tracing::error!(
                    failover = %self.name,
                    error = %e,
                    "Failed to send stop event to stream"
                ),
            }
            self.set_status("");
        }
    }

    /// Replay unacknowledged events and start the nested failover, if any
    fn launch_failover(&self) {
        self.muxer.nack_events();
        let failover = self.failover.lock().clone();
        if let Some(failover) = failover {
            if !failover.is_running() {
                tracing::info!(
                    failover = %self.name,
                    nested = %failover.name(),
                    "Launching nested failover"
                );
                failover.start();
                self.failover_launched.store(true, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::io::Event;
    use crate::multiplexing::{Engine, EngineConfig, MuxerFilter};

    fn event(i: u32) -> Event {
        Event::new(0x10001, Bytes::from(format!("e{}", i)))
    }

    struct RecordingStream {
        written: Arc<Mutex<Vec<Event>>>,
        updates: Arc<AtomicUsize>,
        fail_write: bool,
    }

    impl Stream for RecordingStream {
        fn read(&mut self, _deadline: Deadline) -> Result<ReadOutcome, StreamError> {
            Ok(ReadOutcome::TimedOut)
        }

        fn write(&mut self, event: &Event) -> Result<usize, StreamError> {
            if self.fail_write {
                return Err(StreamError::failed("broken mirror"));
            }
            self.written.lock().push(event.clone());
            Ok(1)
        }

        fn update(&mut self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingEndpoint {
        written: Arc<Mutex<Vec<Event>>>,
        updates: Arc<AtomicUsize>,
        opened: AtomicUsize,
        reachable: AtomicBool,
        refuse_open: bool,
        fail_write: bool,
        mandatory: Option<MuxerFilter>,
    }

    impl Endpoint for RecordingEndpoint {
        fn open(&self) -> Result<Option<Box<dyn Stream>>, StreamError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.refuse_open {
                return Err(StreamError::failed("connection refused"));
            }
            if !self.reachable.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(Box::new(RecordingStream {
                written: Arc::clone(&self.written),
                updates: Arc::clone(&self.updates),
                fail_write: self.fail_write,
            })))
        }

        fn stream_mandatory_filter(&self) -> MuxerFilter {
            self.mandatory.clone().unwrap_or_else(MuxerFilter::none)
        }
    }

    fn reachable() -> Arc<RecordingEndpoint> {
        let endpoint = RecordingEndpoint::default();
        endpoint.reachable.store(true, Ordering::SeqCst);
        Arc::new(endpoint)
    }

    fn setup(dir: &tempfile::TempDir) -> (Arc<Engine>, Arc<Muxer>) {
        let engine = Engine::new(EngineConfig::with_cache_prefix(dir.path().join("central")));
        engine.start();
        let muxer = Muxer::create(&engine, "out", MuxerFilter::all(), MuxerFilter::all(), false)
            .unwrap();
        (engine, muxer)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(5) {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_delivers_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, muxer) = setup(&dir);
        let endpoint = reachable();
        let failover = Failover::new("out", endpoint.clone(), Arc::clone(&muxer));
        failover.start();
        assert!(failover.is_running());

        engine.publish_batch(vec![event(1), event(2), event(3)]);
        assert!(wait_for(|| endpoint.written.lock().len() == 3));
        assert!(wait_for(|| muxer.get_event_queue_size() == 0));
        assert_eq!(failover.stats().state, ConnectionState::Connected);
        assert!(failover.get_initialized());

        failover.exit();
        assert_eq!(failover.state(), FailoverState::Stopped);
    }

    #[test]
    fn test_start_and_exit_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, muxer) = setup(&dir);
        let failover = Failover::new("out", reachable(), muxer);
        failover.start();
        failover.start();
        failover.exit();
        failover.exit();
        assert_eq!(failover.state(), FailoverState::Stopped);
    }

    #[test]
    fn test_unreachable_endpoint_launches_nested_failover() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, muxer) = setup(&dir);

        let primary_endpoint = Arc::new(RecordingEndpoint::default());
        let backup_endpoint = reachable();
        let primary = Failover::new("out", primary_endpoint.clone(), Arc::clone(&muxer));
        primary.set_retry_interval(Duration::from_millis(200));
        let backup = Arc::new(Failover::new(
            "backup",
            backup_endpoint.clone(),
            Arc::clone(&muxer),
        ));
        primary.set_failover(Arc::clone(&backup));
        primary.start();

        engine.publish(event(1));
        assert!(wait_for(|| backup_endpoint.written.lock().len() == 1));
        assert!(backup.is_running());
        assert_eq!(primary.stats().state, ConnectionState::Connecting);

        // Primary comes back: the nested failover is shut down
        primary_endpoint.reachable.store(true, Ordering::SeqCst);
        assert!(wait_for(|| !backup.is_running()));
        engine.publish(event(2));
        assert!(wait_for(|| primary_endpoint
            .written
            .lock()
            .contains(&event(2))));

        let mut tree = Map::new();
        primary.statistics(&mut tree);
        assert!(tree["failover"].is_object());
        assert_eq!(tree["state"], "connected");

        primary.exit();
    }

    #[test]
    fn test_secondaries_mirror_primary() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, muxer) = setup(&dir);
        let primary = reachable();
        let mirror = reachable();
        let broken = Arc::new(RecordingEndpoint {
            fail_write: true,
            ..Default::default()
        });
        broken.reachable.store(true, Ordering::SeqCst);

        let failover = Failover::new("out", primary.clone(), Arc::clone(&muxer));
        failover.add_secondary_endpoint(mirror.clone());
        failover.add_secondary_endpoint(broken);
        failover.start();

        engine.publish_batch(vec![event(1), event(2)]);
        assert!(wait_for(|| mirror.written.lock().len() == 2));
        assert_eq!(*primary.written.lock(), *mirror.written.lock());
        failover.exit();
    }

    #[test]
    fn test_buffering_timeout_delays_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, muxer) = setup(&dir);
        let endpoint = reachable();
        let failover = Failover::new("out", endpoint.clone(), Arc::clone(&muxer));
        failover.set_buffering_timeout(Duration::from_millis(400));

        engine.publish(event(1));
        let started = Instant::now();
        failover.start();

        std::thread::sleep(Duration::from_millis(150));
        assert!(endpoint.written.lock().is_empty());
        assert_eq!(failover.stats().status, "buffering data");

        assert!(wait_for(|| endpoint.written.lock().len() == 1));
        assert!(started.elapsed() >= Duration::from_millis(400));
        failover.exit();
    }

    #[test]
    fn test_secondary_failing_to_open_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, muxer) = setup(&dir);
        let primary = reachable();
        let mirror = reachable();
        let refused = Arc::new(RecordingEndpoint {
            refuse_open: true,
            ..Default::default()
        });
        let absent = Arc::new(RecordingEndpoint::default());

        let failover = Failover::new("out", primary.clone(), Arc::clone(&muxer));
        failover.add_secondary_endpoint(refused.clone());
        failover.add_secondary_endpoint(absent.clone());
        failover.add_secondary_endpoint(mirror.clone());
        failover.start();

        engine.publish_batch(vec![event(1), event(2)]);
        assert!(wait_for(|| primary.written.lock().len() == 2));
        assert!(wait_for(|| mirror.written.lock().len() == 2));
        assert_eq!(refused.opened.load(Ordering::SeqCst), 1);
        assert_eq!(absent.opened.load(Ordering::SeqCst), 1);
        assert_eq!(failover.stats().state, ConnectionState::Connected);
        failover.exit();
    }

    #[test]
    fn test_update_reaches_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, muxer) = setup(&dir);
        let endpoint = reachable();
        let failover = Failover::new("out", endpoint.clone(), muxer);
        failover.start();

        // Every new stream is refreshed once
        assert!(wait_for(|| endpoint.updates.load(Ordering::SeqCst) == 1));

        failover.update();
        assert!(wait_for(|| endpoint.updates.load(Ordering::SeqCst) == 2));
        failover.exit();
    }

    #[test]
    fn test_exit_returns_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, muxer) = setup(&dir);
        let failover = Failover::new("out", reachable(), muxer);
        failover.start();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        failover.exit();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(failover.state(), FailoverState::Stopped);
    }

    #[test]
    fn test_secondary_widens_write_filter() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig::with_cache_prefix(dir.path().join("central")));
        let muxer = Muxer::create(
            &engine,
            "out",
            MuxerFilter::all(),
            MuxerFilter::from_types([0x10001]),
            false,
        )
        .unwrap();
        let failover = Failover::new("out", reachable(), Arc::clone(&muxer));
        failover.add_secondary_endpoint(Arc::new(RecordingEndpoint {
            mandatory: Some(MuxerFilter::from_types([0x30001])),
            ..Default::default()
        }));

        assert!(muxer.write_filter().allows(0x10001));
        assert!(muxer.write_filter().allows(0x30001));
    }
}
