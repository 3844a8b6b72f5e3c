//! Broadcast engine
//!
//! The engine is the hub every muxer subscribes to. Events published while
//! running are handed to every live subscriber, each of which applies its
//! own write filter. Before [`start`](Engine::start) events are retained in
//! memory; after [`stop`](Engine::stop) they go to the unprocessed cache file
//! and are replayed by the next start.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use super::config::EngineConfig;
use super::muxer::Muxer;
use crate::file::PersistentFile;
use crate::io::Event;
use crate::stats::{self, EngineStats};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Events are retained until start
    NotStarted,
    /// Events are delivered to subscribers
    Running,
    /// Events go to the unprocessed cache file
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::NotStarted => "not started",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct EngineInner {
    state: EngineState,
    pending: VecDeque<Event>,
    cache_file: Option<PersistentFile>,
    unprocessed_events: u64,
}

type MuxerSlot = Arc<Mutex<Weak<Muxer>>>;

/// Event broadcast hub
pub struct Engine {
    config: EngineConfig,
    inner: Mutex<EngineInner>,
    /// Set while one thread delivers to subscribers
    sending: AtomicBool,
    subscribers: RwLock<Vec<Weak<Muxer>>>,
    muxers: Mutex<HashMap<String, MuxerSlot>>,
    processed_events: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        tracing::debug!(
            cache_prefix = %config.cache_prefix.display(),
            event_queue_max_size = config.event_queue_max_size,
            "Engine created"
        );
        Arc::new(Self {
            config,
            inner: Mutex::new(EngineInner {
                state: EngineState::NotStarted,
                pending: VecDeque::new(),
                cache_file: None,
                unprocessed_events: 0,
            }),
            sending: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
            muxers: Mutex::new(HashMap::new()),
            processed_events: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Publish one event
    pub fn publish(&self, event: Event) {
        self.publish_batch(vec![event]);
    }

    /// Publish several events, keeping their order
    pub fn publish_batch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }

        let have_to_send = {
            let mut inner = self.inner.lock();
            match inner.state {
                EngineState::Running => {
                    inner.pending.extend(events);
                    true
                }
                EngineState::NotStarted => {
                    inner.pending.extend(events);
                    false
                }
                EngineState::Stopped => {
                    let inner = &mut *inner;
                    write_to_cache(&mut inner.cache_file, &events);
                    inner.unprocessed_events += events.len() as u64;
                    false
                }
            }
        };

        if have_to_send {
            self.send_to_subscribers();
        }
    }

    /// Deliver pending events to every live subscriber
    ///
    /// Only one thread delivers at a time. A thread finding delivery in
    /// progress returns at once: the delivering thread picks up its events
    /// before it gives up the role. Returns true if something was delivered.
    fn send_to_subscribers(&self) -> bool {
        let mut sent = false;
        loop {
            if self
                .sending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return sent;
            }

            let muxers = self.live_subscribers();
            let batch: Option<Vec<Event>> = {
                let mut inner = self.inner.lock();
                if muxers.is_empty() || inner.pending.is_empty() {
                    None
                } else {
                    Some(inner.pending.drain(..).collect())
                }
            };

            let Some(batch) = batch else {
                self.sending.store(false, Ordering::Release);
                return sent;
            };

            tracing::trace!(
                events = batch.len(),
                muxers = muxers.len(),
                "Sending events to muxers"
            );
            for muxer in &muxers {
                muxer.publish(&batch);
            }
            self.processed_events
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            sent = true;

            self.sending.store(false, Ordering::Release);
            drop(muxers);

            // Events may have been queued while we were sending
            if self.inner.lock().pending.is_empty() {
                return sent;
            }
        }
    }

    /// Move to running, replaying the unprocessed cache and retained events
    pub fn start(&self) {
        let have_to_send = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::NotStarted {
                false
            } else {
                let mut events = VecDeque::new();
                let path = self.config.unprocessed_file_path();
                match PersistentFile::open(&path, 0) {
                    Ok(mut cache) => {
                        while let Ok(event) = cache.read() {
                            events.push_back(event);
                        }
                    }
                    Err(e) => tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "Cannot read unprocessed events cache"
                    ),
                }
                tracing::info!(
                    cached = events.len(),
                    retained = inner.pending.len(),
                    "Starting engine"
                );
                events.append(&mut inner.pending);
                inner.pending = events;
                inner.state = EngineState::Running;
                true
            }
        };

        if have_to_send {
            self.send_to_subscribers();
        }
    }

    /// Deliver what is pending, then redirect publications to the
    /// unprocessed cache file
    pub fn stop(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        tracing::info!("Stopping engine");

        loop {
            if self.inner.lock().pending.is_empty() {
                break;
            }
            if !self.send_to_subscribers() {
                if self.sending.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                // No subscriber left to deliver to
                break;
            }
        }

        let mut inner = self.inner.lock();
        let path = self.config.unprocessed_file_path();
        inner.cache_file = match PersistentFile::open(&path, 0) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Cannot open unprocessed events cache, later events will be lost"
                );
                None
            }
        };
        let remaining: Vec<Event> = inner.pending.drain(..).collect();
        if !remaining.is_empty() {
            let inner = &mut *inner;
            write_to_cache(&mut inner.cache_file, &remaining);
            inner.unprocessed_events += remaining.len() as u64;
        }
        inner.state = EngineState::Stopped;
        tracing::info!(
            processed = self.processed_events.load(Ordering::Relaxed),
            "Engine stopped"
        );
    }

    /// Drop every retained event
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        tracing::debug!(events = inner.pending.len(), "Clearing engine pending events");
        inner.pending.clear();
    }

    /// Add `muxer` to the subscribers; subscribing twice is a no-op
    pub fn subscribe(&self, muxer: &Arc<Muxer>) {
        let mut subscribers = self.subscribers.write();
        if subscribers
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(muxer)))
        {
            tracing::debug!(muxer = %muxer.name(), "Muxer already subscribed");
            return;
        }
        subscribers.retain(|w| w.strong_count() > 0);
        subscribers.push(Arc::downgrade(muxer));
        tracing::debug!(
            muxer = %muxer.name(),
            subscribers = subscribers.len(),
            "Muxer subscribed"
        );
    }

    /// Remove `muxer` from the subscribers
    pub fn unsubscribe(&self, muxer: &Muxer) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), muxer));
        tracing::debug!(
            muxer = %muxer.name(),
            subscribers = subscribers.len(),
            "Muxer unsubscribed"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Live muxer called `name`, if any
    pub fn muxer(&self, name: &str) -> Option<Arc<Muxer>> {
        let slot = self.muxers.lock().get(name).cloned()?;
        let muxer = slot.lock().upgrade();
        muxer
    }

    /// Creation slot of muxer `name`
    ///
    /// Holding the slot lock serializes creation and destruction of the
    /// muxers sharing this name.
    pub(crate) fn muxer_slot(&self, name: &str) -> MuxerSlot {
        let mut muxers = self.muxers.lock();
        muxers.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |w| w.strong_count() > 0)
        });
        Arc::clone(muxers.entry(name.to_string()).or_default())
    }

    fn live_subscribers(&self) -> Vec<Arc<Muxer>> {
        self.subscribers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let inner = self.inner.lock();
        EngineStats {
            mode: inner.state.to_string(),
            processed_events: self.processed_events.load(Ordering::Relaxed),
            unprocessed_events: inner.unprocessed_events,
            pending_events: inner.pending.len(),
            muxers: self.subscriber_count(),
        }
    }

    /// Merge engine statistics, including every subscribed muxer, into `tree`
    pub fn statistics(&self, tree: &mut Map<String, Value>) {
        stats::merge(&self.stats(), tree);

        let mut muxers = Map::new();
        for muxer in self.live_subscribers() {
            let mut m = Map::new();
            muxer.statistics(&mut m);
            muxers.insert(muxer.name().to_string(), Value::Object(m));
        }
        tree.insert("muxer_stats".into(), Value::Object(muxers));
    }
}

fn write_to_cache(cache: &mut Option<PersistentFile>, events: &[Event]) {
    let Some(file) = cache.as_mut() else {
        tracing::error!(
            events = events.len(),
            "Engine stopped without cache file, events lost"
        );
        return;
    };
    for event in events {
        if let Err(e) = file.write(event) {
            tracing::error!(error = %e, "Cannot write to unprocessed events cache, events lost");
            *cache = None;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::io::{Deadline, ReadOutcome};
    use crate::multiplexing::MuxerFilter;

    fn event(i: u32) -> Event {
        Event::new(0x10001, Bytes::from(format!("e{}", i)))
    }

    fn engine(dir: &tempfile::TempDir) -> Arc<Engine> {
        Engine::new(EngineConfig::with_cache_prefix(dir.path().join("central")))
    }

    fn muxer(engine: &Arc<Engine>, name: &str) -> Arc<Muxer> {
        Muxer::create(engine, name, MuxerFilter::all(), MuxerFilter::all(), false).unwrap()
    }

    fn drain(muxer: &Muxer) -> Vec<Event> {
        let mut out = Vec::new();
        while let ReadOutcome::Event(e) = muxer.read(Deadline::Immediate) {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_events_retained_until_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let m = muxer(&engine, "a");

        engine.publish(event(1));
        assert_eq!(m.get_event_queue_size(), 0);
        assert_eq!(engine.stats().pending_events, 1);

        engine.start();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(drain(&m), vec![event(1)]);
    }

    #[test]
    fn test_broadcast_to_every_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine.start();
        let a = muxer(&engine, "a");
        let b = muxer(&engine, "b");

        engine.publish_batch(vec![event(1), event(2)]);
        assert_eq!(drain(&a), vec![event(1), event(2)]);
        assert_eq!(drain(&b), vec![event(1), event(2)]);
        assert_eq!(engine.stats().processed_events, 2);
    }

    #[test]
    fn test_dropped_muxer_is_unsubscribed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine.start();
        let a = muxer(&engine, "a");
        drop(muxer(&engine, "b"));

        assert_eq!(engine.subscriber_count(), 1);
        assert!(engine.muxer("b").is_none());
        assert!(engine.muxer("a").is_some());
        engine.publish(event(1));
        assert_eq!(drain(&a), vec![event(1)]);
    }

    #[test]
    fn test_stop_and_replay_cache() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = engine(&dir);
            engine.start();
            engine.stop();
            assert_eq!(engine.state(), EngineState::Stopped);
            engine.publish_batch(vec![event(1), event(2)]);
            assert_eq!(engine.stats().unprocessed_events, 2);
        }

        let engine = engine(&dir);
        let m = muxer(&engine, "a");
        engine.publish(event(3));
        engine.start();
        assert_eq!(drain(&m), vec![event(1), event(2), event(3)]);
    }

    #[test]
    fn test_pending_without_subscribers_survives_stop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = engine(&dir);
            engine.start();
            engine.publish(event(1));
            engine.stop();
        }

        let engine = engine(&dir);
        let m = muxer(&engine, "a");
        engine.start();
        assert_eq!(drain(&m), vec![event(1)]);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine.publish(event(1));
        engine.clear();
        assert_eq!(engine.stats().pending_events, 0);
    }

    #[test]
    fn test_concurrent_publishers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine.start();
        let m = muxer(&engine, "a");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        engine.publish(event(t * 1000 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let received = drain(&m);
        assert_eq!(received.len(), 1000);
        // Per-publisher order is preserved
        for t in 0..4u32 {
            let mine: Vec<_> = received
                .iter()
                .filter(|e| {
                    let n: u32 = std::str::from_utf8(&e.data()[1..]).unwrap().parse().unwrap();
                    n / 1000 == t
                })
                .cloned()
                .collect();
            let expected: Vec<_> = (0..250).map(|i| event(t * 1000 + i)).collect();
            assert_eq!(mine, expected);
        }
    }

    #[test]
    fn test_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let _m = muxer(&engine, "a");
        engine.start();

        let mut tree = Map::new();
        engine.statistics(&mut tree);
        assert_eq!(tree["mode"], "running");
        assert_eq!(tree["muxers"], 1);
        assert!(tree["muxer_stats"]["a"].is_object());
    }
}
