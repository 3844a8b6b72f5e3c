//! Durable FIFO of events
//!
//! [`PersistentFile`] stores events as framed records (see [`codec`]) in a
//! [`Splitter`]. It backs muxer queue files, muxer memory snapshots and the
//! engine's unprocessed-events cache.
//!
//! [`codec`]: super::codec

use std::path::{Path, PathBuf};

use bytes::BytesMut;

use super::codec::{self, Decoded};
use super::splitter::Splitter;
use crate::io::{Event, StreamError};
use crate::misc::RateLimitedLogger;
use crate::stats::QueueFileStats;

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub struct PersistentFile {
    splitter: Splitter,
    rbuf: BytesMut,
    wbuf: BytesMut,
    corrupted_records: u64,
    events_written: u64,
    events_read: u64,
    corruption_log: RateLimitedLogger,
}

impl PersistentFile {
    /// Open the file family rooted at `path`
    pub fn open(path: impl Into<PathBuf>, max_file_size: u64) -> std::io::Result<Self> {
        Ok(Self {
            splitter: Splitter::open(path, max_file_size)?,
            rbuf: BytesMut::new(),
            wbuf: BytesMut::new(),
            corrupted_records: 0,
            events_written: 0,
            events_read: 0,
            corruption_log: RateLimitedLogger::default(),
        })
    }

    pub fn path(&self) -> &Path {
        self.splitter.base_path()
    }

    /// Append one event
    pub fn write(&mut self, event: &Event) -> Result<(), StreamError> {
        self.wbuf.clear();
        codec::encode(event, &mut self.wbuf);
        self.splitter.write(&self.wbuf)?;
        self.events_written += 1;
        Ok(())
    }

    /// Next event in insertion order
    ///
    /// `Err(StreamError::Shutdown)` signals that everything was read, which
    /// is the normal way for a reader to stop. Corrupted chunks are skipped
    /// and counted; a read failure is treated as the end of the file.
    pub fn read(&mut self) -> Result<Event, StreamError> {
        loop {
            match codec::decode(&mut self.rbuf) {
                Decoded::Event(event) => {
                    self.events_read += 1;
                    return Ok(event);
                }
                Decoded::Corrupted { skipped } => {
                    self.corrupted_records += 1;
                    let err = StreamError::Corruption(format!("{} bytes skipped", skipped));
                    self.corruption_log
                        .error(&self.splitter.base_path().display().to_string(), &err);
                    continue;
                }
                Decoded::Incomplete => {}
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.splitter.read(&mut chunk) {
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(StreamError::Shutdown) => {
                    if !self.rbuf.is_empty() {
                        tracing::warn!(
                            path = %self.path().display(),
                            bytes = self.rbuf.len(),
                            "Truncated record at end of file dropped"
                        );
                        self.rbuf.clear();
                    }
                    return Err(StreamError::Shutdown);
                }
                Err(e) => {
                    tracing::error!(
                        path = %self.path().display(),
                        error = %e,
                        "Cannot read file, considering it empty"
                    );
                    self.rbuf.clear();
                    return Err(StreamError::Shutdown);
                }
            }
        }
    }

    /// Delete every part of the file family rooted at `path`
    pub fn remove_all(path: impl Into<PathBuf>) {
        let path = path.into();
        match Splitter::open(&path, 0) {
            Ok(mut s) => s.remove_all_files(),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot remove queue files")
            }
        }
    }

    pub fn corrupted_records(&self) -> u64 {
        self.corrupted_records
    }

    pub fn stats(&self) -> QueueFileStats {
        let total_size = self.splitter.total_size();
        let read_offset = self.splitter.read_offset();
        let percent_processed = if total_size > 0 {
            (read_offset as f64 * 100.0 / total_size as f64).min(100.0)
        } else {
            100.0
        };
        QueueFileStats {
            file_path: self.path().display().to_string(),
            max_file_size: self.splitter.max_file_size(),
            read_file_id: self.splitter.read_id(),
            read_offset,
            write_file_id: self.splitter.write_id(),
            total_size,
            events_written: self.events_written,
            events_read: self.events_read,
            corrupted_records: self.corrupted_records,
            percent_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use bytes::Bytes;

    use super::*;

    fn event(i: u32) -> Event {
        Event::new(0x10001, Bytes::from(format!("event-{}", i)))
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = PersistentFile::open(dir.path().join("c.queue.a"), 0).unwrap();
        for i in 0..100 {
            f.write(&event(i)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(f.read().unwrap(), event(i));
        }
        assert!(f.read().unwrap_err().is_shutdown());
        assert_eq!(f.stats().events_read, 100);
    }

    #[test]
    fn test_empty_file_is_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = PersistentFile::open(dir.path().join("c.queue.none"), 0).unwrap();
        assert!(f.read().unwrap_err().is_shutdown());
    }

    #[test]
    fn test_corruption_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.queue.bad");
        {
            let mut f = PersistentFile::open(&path, 0).unwrap();
            f.write(&event(1)).unwrap();
        }
        {
            let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(b"garbage garbage").unwrap();
        }
        {
            let mut f = PersistentFile::open(&path, 0).unwrap();
            f.write(&event(2)).unwrap();
        }

        let mut f = PersistentFile::open(&path, 0).unwrap();
        assert_eq!(f.read().unwrap(), event(1));
        assert_eq!(f.read().unwrap(), event(2));
        assert_eq!(f.corrupted_records(), 1);
        assert!(f.read().unwrap_err().is_shutdown());
    }

    #[test]
    fn test_damaged_length_loses_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.queue.len");
        {
            let mut f = PersistentFile::open(&path, 0).unwrap();
            for i in 0..5 {
                f.write(&event(i)).unwrap();
            }
        }

        let mut raw = std::fs::read(&path).unwrap();
        let second = codec::encoded_len(&event(0));
        raw[second + 14..second + 18].copy_from_slice(&0x1000u32.to_be_bytes());
        std::fs::write(&path, raw).unwrap();

        let mut f = PersistentFile::open(&path, 0).unwrap();
        let mut recovered = Vec::new();
        while let Ok(e) = f.read() {
            recovered.push(e);
        }
        assert_eq!(recovered, vec![event(0), event(2), event(3), event(4)]);
        assert!(f.corrupted_records() >= 1);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.queue.trunc");
        {
            let mut f = PersistentFile::open(&path, 0).unwrap();
            f.write(&event(1)).unwrap();
            f.write(&event(2)).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let raw = OpenOptions::new().write(true).open(&path).unwrap();
        raw.set_len(len - 3).unwrap();

        let mut f = PersistentFile::open(&path, 0).unwrap();
        assert_eq!(f.read().unwrap(), event(1));
        assert!(f.read().unwrap_err().is_shutdown());
    }

    #[test]
    fn test_remove_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.queue.rm");
        let mut f = PersistentFile::open(&path, 0).unwrap();
        f.write(&event(1)).unwrap();
        drop(f);

        PersistentFile::remove_all(&path);
        assert!(!path.exists());
    }
}
