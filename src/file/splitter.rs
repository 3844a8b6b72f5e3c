//! File split into size-bounded parts
//!
//! A splitter with base path `/var/lib/broker/x.queue.central` stores its data
//! in `/var/lib/broker/x.queue.central`, `...central~1`, `...central~2`, ... in
//! this order. The `~` keeps the parts of `central` apart from the files of a
//! sibling such as `central1`. Writes go to the last part and open a new one once
//! `max_file_size` would be exceeded. Reads start at the first part and delete
//! every part once it is fully consumed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::io::StreamError;

/// Separator between the base path and the id of a part
const PART_SEPARATOR: char = '~';

/// Smallest accepted part size
pub const MIN_FILE_SIZE: u64 = 10_000;

pub struct Splitter {
    base_path: PathBuf,
    max_file_size: u64,
    /// Id of the part being read
    rid: u32,
    roffset: u64,
    rfile: Option<File>,
    /// Id of the part being written
    wid: u32,
    woffset: u64,
    wfile: Option<File>,
}

impl Splitter {
    /// Open the splitter and discover parts left by a previous run
    ///
    /// `max_file_size == 0` means unlimited. Fails only when the parent
    /// directory cannot be listed.
    pub fn open(base_path: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let base_path = base_path.into();
        let max_file_size = if max_file_size == 0 {
            u64::MAX
        } else {
            max_file_size.max(MIN_FILE_SIZE)
        };

        let ids = existing_part_ids(&base_path)?;
        let rid = ids.first().copied().unwrap_or(0);
        let wid = ids.last().copied().unwrap_or(0);

        tracing::debug!(
            path = %base_path.display(),
            parts = ids.len(),
            rid,
            wid,
            "Splitter opened"
        );

        Ok(Self {
            base_path,
            max_file_size,
            rid,
            roffset: 0,
            rfile: None,
            wid,
            woffset: 0,
            wfile: None,
        })
    }

    /// Path of the part with the given id
    pub fn file_path(&self, id: u32) -> PathBuf {
        part_path(&self.base_path, id)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn read_id(&self) -> u32 {
        self.rid
    }

    pub fn read_offset(&self) -> u64 {
        self.roffset
    }

    pub fn write_id(&self) -> u32 {
        self.wid
    }

    /// Append `buf`, moving to the next part if the current one is full
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.wfile.is_none() {
            self.open_write_file()?;
        }

        if self.woffset > 0 && self.woffset + buf.len() as u64 > self.max_file_size {
            if let Some(f) = self.wfile.as_mut() {
                f.flush()?;
            }
            self.wid += 1;
            self.open_write_file()?;
        }

        let file = self
            .wfile
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no write file"))?;
        file.write_all(buf)?;
        self.woffset += buf.len() as u64;
        Ok(())
    }

    /// Read up to `buf.len()` bytes
    ///
    /// Returns `Err(StreamError::Shutdown)` when every part has been
    /// consumed. Consumed parts are removed from disk.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        loop {
            if self.rfile.is_none() {
                match File::open(self.file_path(self.rid)) {
                    Ok(f) => self.rfile = Some(f),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        if self.rid < self.wid {
                            self.rid += 1;
                            self.roffset = 0;
                            continue;
                        }
                        return Err(StreamError::Shutdown);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let Some(file) = self.rfile.as_mut() else {
                return Err(StreamError::Shutdown);
            };
            file.seek(SeekFrom::Start(self.roffset))?;
            let rb = match file.read(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
                Err(e) => return Err(e.into()),
            };

            if rb > 0 {
                self.roffset += rb as u64;
                return Ok(rb);
            }

            // End of the current part
            let path = self.file_path(self.rid);
            tracing::info!(path = %path.display(), "End of file reached, erasing it");
            self.rfile = None;
            if self.rid == self.wid {
                self.wfile = None;
                self.woffset = 0;
            }
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::error!(path = %path.display(), error = %e, "Cannot remove file");
                }
            }

            if self.rid < self.wid {
                self.rid += 1;
                self.roffset = 0;
            } else {
                self.roffset = 0;
                return Err(StreamError::Shutdown);
            }
        }
    }

    /// Bytes currently stored in all parts, read or not
    pub fn total_size(&self) -> u64 {
        (self.rid..=self.wid)
            .filter_map(|id| fs::metadata(self.file_path(id)).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Close files and delete every part
    pub fn remove_all_files(&mut self) {
        self.rfile = None;
        self.wfile = None;
        let ids = existing_part_ids(&self.base_path).unwrap_or_default();
        for id in ids {
            let path = self.file_path(id);
            if let Err(e) = fs::remove_file(&path) {
                tracing::error!(path = %path.display(), error = %e, "Cannot remove file");
            }
        }
        self.rid = 0;
        self.roffset = 0;
        self.wid = 0;
        self.woffset = 0;
    }

    fn open_write_file(&mut self) -> io::Result<()> {
        let path = self.file_path(self.wid);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.woffset = file.metadata()?.len();
        tracing::debug!(path = %path.display(), offset = self.woffset, "Write file opened");
        self.wfile = Some(file);
        Ok(())
    }
}

fn part_path(base: &Path, id: u32) -> PathBuf {
    if id == 0 {
        base.to_path_buf()
    } else {
        let mut s = base.as_os_str().to_os_string();
        s.push(format!("{}{}", PART_SEPARATOR, id));
        PathBuf::from(s)
    }
}

/// Sorted ids of the parts present on disk
fn existing_part_ids(base: &Path) -> io::Result<Vec<u32>> {
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(base_name) = base.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };

    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(base_name) else {
            continue;
        };
        if suffix.is_empty() {
            ids.push(0);
        } else if let Some(id) = parse_part_id(suffix) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Id of a `~<id>` suffix, rejecting anything `part_path` would not produce
fn parse_part_id(suffix: &str) -> Option<u32> {
    let digits = suffix.strip_prefix(PART_SEPARATOR)?;
    let id: u32 = digits.parse().ok()?;
    (id > 0 && id.to_string() == digits).then_some(id)
}
