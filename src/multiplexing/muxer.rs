//! Per-subscriber event queue
//!
//! A muxer sits between the engine and one consumer (a feeder or a
//! failover). It keeps a FIFO of events with a read cursor: events before the
//! cursor were delivered but not acknowledged yet, events after it are still
//! to be delivered. Memory is bounded by the engine configuration; overflow
//! goes to a queue file on disk and is read back as acknowledgements free
//! room.
//!
//! Persistent muxers also save their in-memory queue to a memory file when
//! they are dropped and reload it when recreated.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{Map, Value};

use super::engine::Engine;
use super::filter::MuxerFilter;
use crate::error::Result;
use crate::file::PersistentFile;
use crate::io::{Deadline, Event, ReadOutcome};
use crate::stats::{self, MuxerStats};

/// Callback fired once when events become available after a drained read
pub type ReadHandler = Box<dyn FnOnce() + Send>;

/// Minimum delay between two statistics refreshes
const STATS_INTERVAL: Duration = Duration::from_secs(1);

struct Filters {
    read: MuxerFilter,
    write: MuxerFilter,
    read_str: String,
    write_str: String,
}

struct MuxerQueue {
    events: VecDeque<Event>,
    /// Number of delivered, unacknowledged events at the front of `events`
    pos: usize,
    file: Option<PersistentFile>,
    read_handler: Option<ReadHandler>,
    stats: MuxerStats,
    stats_updated: Option<Instant>,
}

impl MuxerQueue {
    /// Append one event, returning the read handler to fire if a reader was
    /// waiting on a drained queue
    fn push(&mut self, event: Event, cv: &Condvar) -> Option<ReadHandler> {
        let drained = self.pos == self.events.len();
        self.events.push_back(event);
        if drained {
            cv.notify_one();
            self.read_handler.take()
        } else {
            None
        }
    }

    fn next_unread(&mut self) -> Option<Event> {
        let event = self.events.get(self.pos).cloned();
        if event.is_some() {
            self.pos += 1;
        }
        event
    }

    fn event_from_file(&mut self) -> Option<Event> {
        let file = self.file.as_mut()?;
        match file.read() {
            Ok(event) => Some(event),
            Err(_) => {
                // Fully read: the splitter already deleted the parts
                self.file = None;
                None
            }
        }
    }

    fn update_stats(&mut self, name: &str, force: bool) {
        let now = Instant::now();
        if !force
            && self
                .stats_updated
                .is_some_and(|at| now.duration_since(at) < STATS_INTERVAL)
        {
            return;
        }
        self.stats_updated = Some(now);
        self.stats = MuxerStats {
            name: name.to_string(),
            total_events: self.events.len(),
            unacknowledged_events: self.pos,
            queue_file: self
                .file
                .as_ref()
                .map(|f| f.path().display().to_string())
                .unwrap_or_default(),
            updated_at: stats::unix_now(),
        };
    }
}

/// Event queue of one subscriber
pub struct Muxer {
    name: String,
    engine: Arc<Engine>,
    queue_file_path: PathBuf,
    memory_file_path: PathBuf,
    queue_file_max_size: u64,
    max_queue_size: usize,
    persistent: bool,
    filters: RwLock<Filters>,
    queue: Mutex<MuxerQueue>,
    cv: Condvar,
}

impl Muxer {
    /// Get or create the muxer called `name` and subscribe it to `engine`
    ///
    /// When a live muxer with this name already exists, its filters are
    /// replaced by the given ones and it is returned as is. Creation is
    /// serialized per name, so concurrent callers get the same instance.
    pub fn create(
        engine: &Arc<Engine>,
        name: impl Into<String>,
        read_filter: MuxerFilter,
        write_filter: MuxerFilter,
        persistent: bool,
    ) -> Result<Arc<Muxer>> {
        let name = name.into();
        let slot = engine.muxer_slot(&name);

        let muxer = {
            let mut slot = slot.lock();
            match slot.upgrade() {
                Some(existing) => {
                    tracing::debug!(muxer = %name, "Muxer already exists, reusing it");
                    existing.set_read_filter(read_filter);
                    existing.set_write_filter(write_filter);
                    existing
                }
                None => {
                    let muxer = Arc::new(Muxer::new(
                        engine,
                        name,
                        read_filter,
                        write_filter,
                        persistent,
                    )?);
                    *slot = Arc::downgrade(&muxer);
                    muxer
                }
            }
        };

        engine.subscribe(&muxer);
        Ok(muxer)
    }

    fn new(
        engine: &Arc<Engine>,
        name: String,
        read_filter: MuxerFilter,
        write_filter: MuxerFilter,
        persistent: bool,
    ) -> Result<Self> {
        let config = engine.config();
        let queue_file_path = config.queue_file_path(&name);
        let memory_file_path = config.memory_file_path(&name);
        let max_queue_size = config.max_queue_size();

        let mut events = VecDeque::new();
        if persistent {
            match PersistentFile::open(&memory_file_path, 0) {
                Ok(mut memory) => {
                    while let Ok(event) = memory.read() {
                        events.push_back(event);
                    }
                }
                Err(e) => tracing::error!(
                    muxer = %name,
                    path = %memory_file_path.display(),
                    error = %e,
                    "Cannot load memory file"
                ),
            }
        }

        let mut file = PersistentFile::open(&queue_file_path, config.queue_file_max_size)?;
        let mut file_open = true;
        while events.len() < max_queue_size {
            match file.read() {
                Ok(event) => events.push_back(event),
                Err(_) => {
                    file_open = false;
                    break;
                }
            }
        }

        tracing::info!(
            muxer = %name,
            events = events.len(),
            queue_file = file_open,
            read_filter = %read_filter,
            write_filter = %write_filter,
            "Muxer created"
        );

        let mut queue = MuxerQueue {
            events,
            pos: 0,
            file: file_open.then_some(file),
            read_handler: None,
            stats: MuxerStats::default(),
            stats_updated: None,
        };
        queue.update_stats(&name, true);

        Ok(Self {
            queue_file_max_size: config.queue_file_max_size,
            engine: Arc::clone(engine),
            queue_file_path,
            memory_file_path,
            max_queue_size,
            persistent,
            filters: RwLock::new(Filters {
                read_str: read_filter.to_string(),
                write_str: write_filter.to_string(),
                read: read_filter,
                write: write_filter,
            }),
            queue: Mutex::new(queue),
            cv: Condvar::new(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn queue_file_path(&self) -> &Path {
        &self.queue_file_path
    }

    pub fn memory_file_path(&self) -> &Path {
        &self.memory_file_path
    }

    /// Stop receiving events from the engine
    pub fn unsubscribe(&self) {
        self.engine.unsubscribe(self);
    }

    /// Accept events from the engine
    ///
    /// Events rejected by the write filter are dropped. The others go to
    /// memory while there is room and nothing is waiting in the queue file,
    /// then to the queue file, so that the overall order is preserved.
    pub fn publish(&self, events: &[Event]) {
        let mut handler = None;
        {
            let filters = self.filters.read();
            let mut idx = 0;

            loop {
                let mut pushed = false;
                {
                    let mut q = self.queue.lock();
                    while idx < events.len()
                        && q.events.len() < self.max_queue_size
                        && q.file.is_none()
                    {
                        let event = &events[idx];
                        idx += 1;
                        if !filters.write.allows(event.type_id()) {
                            tracing::trace!(
                                muxer = %self.name,
                                event_type = %event.event_type(),
                                "Event rejected by write filter"
                            );
                            continue;
                        }
                        if let Some(h) = q.push(event.clone(), &self.cv) {
                            handler = Some(h);
                        }
                        pushed = true;
                    }
                    q.update_stats(&self.name, false);
                }

                if idx == events.len() {
                    break;
                }
                if pushed {
                    // Give blocked readers a chance to free room before
                    // spilling to disk
                    continue;
                }

                let mut q = self.queue.lock();
                for event in &events[idx..] {
                    if filters.write.allows(event.type_id()) {
                        self.write_to_file(&mut q, event);
                    }
                }
                q.update_stats(&self.name, false);
                break;
            }
        }

        if let Some(h) = handler {
            h();
        }
    }

    fn write_to_file(&self, q: &mut MuxerQueue, event: &Event) {
        if q.file.is_none() {
            match PersistentFile::open(&self.queue_file_path, self.queue_file_max_size) {
                Ok(file) => q.file = Some(file),
                Err(e) => {
                    tracing::error!(
                        muxer = %self.name,
                        path = %self.queue_file_path.display(),
                        error = %e,
                        "Cannot open queue file, event lost"
                    );
                    return;
                }
            }
        }
        if let Some(file) = q.file.as_mut() {
            if let Err(e) = file.write(event) {
                tracing::error!(
                    muxer = %self.name,
                    path = %self.queue_file_path.display(),
                    error = %e,
                    "Cannot write to queue file, event lost"
                );
                q.file = None;
            }
        }
    }

    /// Send one event from the subscriber to the engine
    pub fn write(&self, event: Event) {
        if self.filters.read().read.allows(event.type_id()) {
            self.engine.publish(event);
        } else {
            tracing::trace!(
                muxer = %self.name,
                event_type = %event.event_type(),
                "Event rejected by read filter"
            );
        }
    }

    /// Send several events from the subscriber to the engine
    pub fn write_batch(&self, events: Vec<Event>) {
        let accepted: Vec<Event> = {
            let filters = self.filters.read();
            events
                .into_iter()
                .filter(|e| filters.read.allows(e.type_id()))
                .collect()
        };
        if !accepted.is_empty() {
            self.engine.publish_batch(accepted);
        }
    }

    /// Read the next undelivered event
    ///
    /// With [`Deadline::Immediate`] this never blocks and returns
    /// [`ReadOutcome::Empty`] when nothing is available. Otherwise it waits
    /// for a publication, a [`wake`](Muxer::wake) or the deadline.
    pub fn read(&self, deadline: Deadline) -> ReadOutcome {
        let mut q = self.queue.lock();
        if let Some(event) = q.next_unread() {
            q.update_stats(&self.name, false);
            return ReadOutcome::Event(event);
        }

        let timed_out = match deadline {
            Deadline::Immediate => return ReadOutcome::Empty,
            Deadline::Never => {
                self.cv.wait(&mut q);
                false
            }
            Deadline::At(at) => self.cv.wait_until(&mut q, at).timed_out(),
        };

        match q.next_unread() {
            Some(event) => {
                q.update_stats(&self.name, false);
                ReadOutcome::Event(event)
            }
            None if timed_out => ReadOutcome::TimedOut,
            None => ReadOutcome::Empty,
        }
    }

    /// Read up to `max` undelivered events into `out` without blocking
    ///
    /// Returns true if more events remain. Otherwise `on_ready` is kept and
    /// fired once, outside any muxer lock, as soon as an event arrives.
    pub fn read_batch(&self, out: &mut Vec<Event>, max: usize, on_ready: ReadHandler) -> bool {
        let mut q = self.queue.lock();
        let mut taken = 0;
        while taken < max {
            match q.next_unread() {
                Some(event) => {
                    out.push(event);
                    taken += 1;
                }
                None => break,
            }
        }
        q.update_stats(&self.name, false);

        if q.pos < q.events.len() {
            true
        } else {
            q.read_handler = Some(on_ready);
            false
        }
    }

    /// Drop any pending read handler
    pub fn clear_read_handler(&self) {
        self.queue.lock().read_handler = None;
    }

    /// Remove the `count` oldest delivered events and refill from the queue
    /// file. Returns the number actually removed.
    pub fn ack_events(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }

        let mut handler = None;
        let acked = {
            let mut q = self.queue.lock();
            let mut acked = 0;
            while acked < count && !q.events.is_empty() {
                if q.pos == 0 {
                    tracing::error!(
                        muxer = %self.name,
                        requested = count,
                        acknowledged = acked,
                        "Acknowledging more events than delivered"
                    );
                    break;
                }
                q.events.pop_front();
                q.pos -= 1;
                acked += 1;
            }

            while q.events.len() < self.max_queue_size {
                match q.event_from_file() {
                    Some(event) => {
                        if let Some(h) = q.push(event, &self.cv) {
                            handler = Some(h);
                        }
                    }
                    None => break,
                }
            }
            q.update_stats(&self.name, false);
            acked
        };

        if let Some(h) = handler {
            h();
        }
        tracing::trace!(muxer = %self.name, acknowledged = acked, "Events acknowledged");
        acked
    }

    /// Rewind the read cursor so that unacknowledged events are delivered again
    pub fn nack_events(&self) {
        let handler = {
            let mut q = self.queue.lock();
            tracing::debug!(
                muxer = %self.name,
                events = q.pos,
                "Rewinding unacknowledged events"
            );
            q.pos = 0;
            q.update_stats(&self.name, false);
            if q.events.is_empty() {
                None
            } else {
                self.cv.notify_all();
                q.read_handler.take()
            }
        };
        if let Some(h) = handler {
            h();
        }
    }

    /// Wake every thread blocked in [`read`](Muxer::read)
    pub fn wake(&self) {
        let _q = self.queue.lock();
        self.cv.notify_all();
    }

    /// Number of events held in memory
    pub fn get_event_queue_size(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Latest statistics snapshot, refreshed now
    pub fn stats(&self) -> MuxerStats {
        let mut q = self.queue.lock();
        q.update_stats(&self.name, true);
        q.stats.clone()
    }

    /// Merge muxer introspection data into `tree`
    pub fn statistics(&self, tree: &mut Map<String, Value>) {
        {
            let q = self.queue.lock();
            tree.insert("queue_file_enabled".into(), q.file.is_some().into());
            if let Some(file) = q.file.as_ref() {
                match serde_json::to_value(file.stats()) {
                    Ok(v) => {
                        tree.insert("queue_file".into(), v);
                    }
                    Err(e) => tracing::warn!(error = %e, "Cannot serialize queue file stats"),
                }
            }
            tree.insert("unacknowledged_events".into(), q.pos.into());
            tree.insert("total_events".into(), q.events.len().into());
        }
        let filters = self.filters.read();
        tree.insert("read_filters".into(), filters.read_str.clone().into());
        tree.insert("write_filters".into(), filters.write_str.clone().into());
    }

    /// Delete the queue file, losing the events it holds
    pub fn remove_queue_files(&self) {
        tracing::info!(
            muxer = %self.name,
            path = %self.queue_file_path.display(),
            "Removing queue files"
        );
        let mut q = self.queue.lock();
        q.file = None;
        PersistentFile::remove_all(&self.queue_file_path);
    }

    pub fn set_read_filter(&self, filter: MuxerFilter) {
        let mut filters = self.filters.write();
        tracing::trace!(muxer = %self.name, filter = %filter, "Read filter updated");
        filters.read_str = filter.to_string();
        filters.read = filter;
    }

    pub fn set_write_filter(&self, filter: MuxerFilter) {
        let mut filters = self.filters.write();
        tracing::trace!(muxer = %self.name, filter = %filter, "Write filter updated");
        filters.write_str = filter.to_string();
        filters.write = filter;
    }

    pub fn read_filter(&self) -> MuxerFilter {
        self.filters.read().read.clone()
    }

    pub fn write_filter(&self) -> MuxerFilter {
        self.filters.read().write.clone()
    }

    pub fn read_filters_as_str(&self) -> String {
        self.filters.read().read_str.clone()
    }

    pub fn write_filters_as_str(&self) -> String {
        self.filters.read().write_str.clone()
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.engine.unsubscribe(self);

        // Hold the name slot so that a muxer recreated under the same name
        // does not load the memory file while it is being written
        let slot = self.engine.muxer_slot(&self.name);
        let _guard = slot.lock();

        let q = self.queue.get_mut();
        tracing::info!(
            muxer = %self.name,
            events = q.events.len(),
            "Destroying muxer"
        );
        q.read_handler = None;
        q.file = None;

        if self.persistent && !q.events.is_empty() {
            match PersistentFile::open(&self.memory_file_path, 0) {
                Ok(mut memory) => {
                    for event in &q.events {
                        if let Err(e) = memory.write(event) {
                            tracing::error!(
                                muxer = %self.name,
                                error = %e,
                                "Cannot write memory file, events lost"
                            );
                            break;
                        }
                    }
                }
                Err(e) => tracing::error!(
                    muxer = %self.name,
                    path = %self.memory_file_path.display(),
                    error = %e,
                    "Cannot open memory file, events lost"
                ),
            }
        }
        q.events.clear();
        q.pos = 0;
    }
}
