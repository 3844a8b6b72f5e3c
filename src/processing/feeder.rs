//! Feeder: pumps events between one accepted client stream and the engine
//!
//! A feeder owns a non-persistent muxer named after it. Two directions run
//! independently on the tokio runtime:
//!
//! - client → engine: a short repeating tick reads what the client has and
//!   hands it to the muxer's fan-in path;
//! - muxer → client: triggered by the muxer's read hook whenever events
//!   become available, drains them to the client and acknowledges what was
//!   written.
//!
//! Stream calls may block for a bounded time, so both directions run on the
//! blocking pool and never on a runtime worker.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::io::{Deadline, Event, ReadOutcome, Stream, StreamError};
use crate::multiplexing::{Engine, Muxer, MuxerFilter};
use crate::stats::{self, ConnectionState, EndpointStats};

/// Tick of the client → engine direction
const STREAM_READ_TICK: Duration = Duration::from_millis(200);
/// Time budget of one pass in either direction
const PASS_BUDGET: Duration = Duration::from_millis(100);
/// Maximum events moved in one pass
const MAX_EVENTS_PER_PASS: usize = 0x10000;
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const STATS_LOCK_WAIT: Duration = Duration::from_millis(300);

/// Feeder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederState {
    Running,
    Finished,
}

impl std::fmt::Display for FeederState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeederState::Running => f.write_str("running"),
            FeederState::Finished => f.write_str("finished"),
        }
    }
}

pub struct Feeder {
    name: String,
    muxer: Arc<Muxer>,
    client: Mutex<Box<dyn Stream>>,
    state: Mutex<FeederState>,
    /// Serializes muxer → client passes so acknowledgements match deliveries
    muxer_reader: Mutex<()>,
    stats: Mutex<EndpointStats>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl Feeder {
    /// Create a feeder for `client` and start both directions on `runtime`
    pub fn create(
        name: impl Into<String>,
        engine: &Arc<Engine>,
        client: Box<dyn Stream>,
        read_filter: MuxerFilter,
        write_filter: MuxerFilter,
        runtime: Handle,
    ) -> Result<Arc<Feeder>> {
        let name = name.into();
        let muxer = Muxer::create(engine, name.clone(), read_filter, write_filter, false)?;

        let mut stats = EndpointStats::new(name.clone());
        stats.state = ConnectionState::Connected;
        stats.status = FeederState::Running.to_string();
        stats.set_last_connection_attempt();
        stats.set_last_connection_success();

        let feeder = Arc::new(Feeder {
            name,
            muxer,
            client: Mutex::new(client),
            state: Mutex::new(FeederState::Running),
            muxer_reader: Mutex::new(()),
            stats: Mutex::new(stats),
            cancel: CancellationToken::new(),
            runtime,
        });

        tracing::info!(
            feeder = %feeder.name,
            read_filters = %feeder.muxer.read_filters_as_str(),
            write_filters = %feeder.muxer.write_filters_as_str(),
            "Feeder created"
        );

        feeder.spawn_stream_reader();
        feeder.spawn_stats_refresher();
        Feeder::schedule_muxer_read(Arc::downgrade(&feeder), feeder.runtime.clone());

        Ok(feeder)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn muxer(&self) -> &Arc<Muxer> {
        &self.muxer
    }

    pub fn state(&self) -> FeederState {
        *self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == FeederState::Finished
    }

    fn spawn_stream_reader(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            let mut ticker = interval(STREAM_READ_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(feeder) = weak.upgrade() else { break };
                match tokio::task::spawn_blocking(move || feeder.read_from_stream()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Feeder stream reader failed");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stats_refresher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.runtime.spawn(async move {
            let mut ticker = interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(feeder) = weak.upgrade() else { break };
                let queued = feeder.muxer.get_event_queue_size();
                feeder.stats.lock().queued_events = queued;
            }
        });
    }

    /// Move what the client has to the engine; returns false once the
    /// feeder must stop ticking
    fn read_from_stream(&self) -> bool {
        if self.is_finished() {
            return false;
        }

        let deadline = Deadline::At(Instant::now() + PASS_BUDGET);
        let mut events: Vec<Event> = Vec::new();
        let result = {
            let mut client = self.client.lock();
            loop {
                if events.len() >= MAX_EVENTS_PER_PASS || deadline.is_expired() {
                    break Ok(());
                }
                match client.read(deadline) {
                    Ok(ReadOutcome::Event(event)) => events.push(event),
                    Ok(_) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        // Whatever was read before a failure still goes to the engine
        if !events.is_empty() {
            tracing::trace!(feeder = %self.name, events = events.len(), "Events read from client");
            self.muxer.write_batch(events);
        }

        match result {
            Ok(()) => true,
            Err(StreamError::Shutdown) => {
                tracing::info!(feeder = %self.name, "Client stream shut down");
                self.stop();
                false
            }
            Err(StreamError::ConnectionClosed) => {
                tracing::info!(feeder = %self.name, "Client connection closed");
                self.stop();
                false
            }
            Err(e) => {
                tracing::error!(feeder = %self.name, error = %e, "Error while reading from client");
                self.set_last_error(&e);
                self.stop();
                false
            }
        }
    }

    fn schedule_muxer_read(weak: Weak<Feeder>, runtime: Handle) {
        runtime.spawn_blocking(move || {
            if let Some(feeder) = weak.upgrade() {
                feeder.read_from_muxer();
            }
        });
    }

    /// Drain the muxer to the client, acknowledging what was written
    fn read_from_muxer(self: &Arc<Self>) {
        let _reader = self.muxer_reader.lock();
        let started = Instant::now();

        loop {
            if self.is_finished() {
                return;
            }

            let mut events = Vec::new();
            let weak = Arc::downgrade(self);
            let runtime = self.runtime.clone();
            let more = self.muxer.read_batch(
                &mut events,
                MAX_EVENTS_PER_PASS,
                Box::new(move || Feeder::schedule_muxer_read(weak, runtime)),
            );

            if !events.is_empty() {
                let (written, failure) = {
                    let mut client = self.client.lock();
                    let mut written = 0;
                    let mut failure = None;
                    for event in &events {
                        match client.write(event) {
                            Ok(_) => written += 1,
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    (written, failure)
                };

                self.muxer.ack_events(written);
                tracing::trace!(feeder = %self.name, events = written, "Events written to client");

                if let Some(e) = failure {
                    if e.is_shutdown() || e.is_connection_closed() {
                        tracing::info!(feeder = %self.name, error = %e, "Client gone while writing");
                    } else {
                        tracing::error!(feeder = %self.name, error = %e, "Error while writing to client");
                        self.set_last_error(&e);
                    }
                    self.stop();
                    return;
                }
            }

            if !more {
                return;
            }
            if started.elapsed() >= PASS_BUDGET {
                // Let other feeders have the pool, continue in a new pass
                Feeder::schedule_muxer_read(Arc::downgrade(self), self.runtime.clone());
                return;
            }
        }
    }

    fn set_last_error(&self, e: &StreamError) {
        self.stats.lock().last_error = e.to_string();
    }

    /// Stop both directions and release the client
    ///
    /// Idempotent. The muxer is unsubscribed and its queue files removed:
    /// undelivered events of a feeder do not outlive it.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == FeederState::Finished {
                return;
            }
            *state = FeederState::Finished;
        }
        tracing::info!(feeder = %self.name, "Stopping feeder");

        self.muxer.unsubscribe();
        self.cancel.cancel();

        match self.client.lock().stop() {
            Ok(acknowledged) => tracing::debug!(
                feeder = %self.name,
                acknowledged,
                "Client stream stopped"
            ),
            Err(e) => tracing::error!(
                feeder = %self.name,
                error = %e,
                "Failed to send stop event to client"
            ),
        }

        self.muxer.remove_queue_files();
        self.muxer.clear_read_handler();

        let mut stats = self.stats.lock();
        stats.state = ConnectionState::Disconnected;
        stats.status = FeederState::Finished.to_string();
    }

    /// Latest statistics snapshot
    pub fn stats(&self) -> EndpointStats {
        self.stats.lock().clone()
    }

    /// Merge feeder, client and muxer statistics into `tree`
    ///
    /// Waits at most 300 ms for the client; a busy client is reported as such.
    pub fn statistics(&self, tree: &mut Map<String, Value>) {
        stats::merge(&*self.stats.lock(), tree);

        match self.client.try_lock_for(STATS_LOCK_WAIT) {
            Some(client) => client.statistics(tree),
            None => {
                tree.insert("stream_status".into(), "busy".into());
            }
        }

        let mut muxer = Map::new();
        self.muxer.statistics(&mut muxer);
        tree.insert("muxer".into(), Value::Object(muxer));
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stop();
    }
}
