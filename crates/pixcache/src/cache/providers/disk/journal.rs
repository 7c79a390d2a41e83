//! # Disk Journal
//!
//! Append-only JSON-lines log backing the disk index. The first line is a
//! header; every following line is one [`JournalRecord`]. Replaying the file
//! reproduces the committed entries and their recency order.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::types::CacheKey;
use crate::error::CacheError;

pub(crate) const JOURNAL_FILE: &str = "journal";
pub(crate) const JOURNAL_TMP_FILE: &str = "journal.tmp";
/// Target of a background compaction, distinct from the one `rebuild` uses
pub(crate) const JOURNAL_COMPACT_FILE: &str = "journal.compact";

const JOURNAL_MAGIC: &str = "pixcache.journal";
const JOURNAL_VERSION: u32 = 1;

/// Compaction kicks in once this many records no longer describe a live entry
pub(crate) const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

#[derive(Debug, Serialize, Deserialize)]
struct JournalHeader {
    magic: String,
    version: u32,
}

/// One line of the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    /// A write transaction was opened
    Dirty { key: String },
    /// A write transaction was committed
    Clean {
        key: String,
        size: u64,
        generation: u64,
    },
    /// A write transaction was discarded; any older committed entry survives
    Abort { key: String },
    /// A committed entry was evicted or removed
    Remove { key: String },
    /// A committed entry was read
    Read { key: String },
}

/// Committed state of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub size: u64,
    pub generation: u64,
}

/// State reconstructed from a journal on open
pub(crate) struct Replay {
    pub entries: LruCache<CacheKey, IndexEntry>,
    /// Keys with a write that was never resolved
    pub dirty: HashSet<CacheKey>,
    pub redundant_ops: usize,
    /// The last line was cut short by a crash mid-append
    pub torn_tail: bool,
}

/// Read and replay the journal in `directory`.
///
/// Returns `Ok(None)` when no journal exists yet and
/// [`CacheError::CorruptJournal`] when its contents cannot be trusted.
pub(crate) fn replay(directory: &Path) -> Result<Option<Replay>, CacheError> {
    let path = directory.join(JOURNAL_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(CacheError::CorruptJournal(format!("not UTF-8: {e}")));
        }
        Err(e) => return Err(e.into()),
    };

    let mut lines: Vec<&str> = contents.split('\n').collect();
    // A complete journal ends with a newline, leaving an empty final segment
    let tail = lines.pop().unwrap_or_default();
    let torn_tail = !tail.is_empty();
    if torn_tail {
        warn!(path = ?path, "Ignoring incomplete trailing journal record");
    }

    let mut lines = lines.into_iter();
    let header: JournalHeader = lines
        .next()
        .ok_or_else(|| CacheError::CorruptJournal("missing header".to_string()))
        .and_then(|line| {
            serde_json::from_str(line)
                .map_err(|e| CacheError::CorruptJournal(format!("bad header: {e}")))
        })?;
    if header.magic != JOURNAL_MAGIC || header.version != JOURNAL_VERSION {
        return Err(CacheError::CorruptJournal(format!(
            "unexpected header {}/{}",
            header.magic, header.version
        )));
    }

    let mut entries: LruCache<CacheKey, IndexEntry> = LruCache::unbounded();
    let mut dirty = HashSet::new();
    let mut record_count = 0usize;

    for (line_no, line) in lines.enumerate() {
        let record: JournalRecord = serde_json::from_str(line).map_err(|e| {
            CacheError::CorruptJournal(format!("line {}: {e}", line_no + 2))
        })?;
        record_count += 1;
        apply(&mut entries, &mut dirty, record)?;
    }

    let redundant_ops = record_count.saturating_sub(entries.len());
    debug!(
        path = ?path,
        entries = entries.len(),
        dirty = dirty.len(),
        redundant_ops,
        "Replayed disk cache journal"
    );

    Ok(Some(Replay {
        entries,
        dirty,
        redundant_ops,
        torn_tail,
    }))
}

fn apply(
    entries: &mut LruCache<CacheKey, IndexEntry>,
    dirty: &mut HashSet<CacheKey>,
    record: JournalRecord,
) -> Result<(), CacheError> {
    let parse = |raw: &str| {
        CacheKey::parse(raw).ok_or_else(|| CacheError::CorruptJournal(format!("bad key {raw:?}")))
    };

    match record {
        JournalRecord::Dirty { key } => {
            dirty.insert(parse(&key)?);
        }
        JournalRecord::Clean {
            key,
            size,
            generation,
        } => {
            let key = parse(&key)?;
            dirty.remove(&key);
            entries.put(key, IndexEntry { size, generation });
        }
        JournalRecord::Abort { key } => {
            dirty.remove(&parse(&key)?);
        }
        JournalRecord::Remove { key } => {
            let key = parse(&key)?;
            dirty.remove(&key);
            entries.pop(&key);
        }
        JournalRecord::Read { key } => {
            entries.get(&parse(&key)?);
        }
    }
    Ok(())
}

/// Open handle for appending records
pub(crate) struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Journal {
    /// Open an existing journal for appending
    pub(crate) fn open_append(directory: &Path) -> Result<Self, CacheError> {
        let path = directory.join(JOURNAL_FILE);
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Write a compact journal holding only `entries`, eldest first, and
    /// atomically replace the current one with it
    pub(crate) fn rebuild(
        directory: &Path,
        entries: &LruCache<CacheKey, IndexEntry>,
    ) -> Result<Self, CacheError> {
        // `iter` walks from most to least recently used
        Compaction::begin(directory, JOURNAL_TMP_FILE, entries.iter().rev())?.install()
    }

    /// Append one record and hand it to the OS
    pub(crate) fn append(&mut self, record: &JournalRecord) -> Result<(), CacheError> {
        self.append_buffered(record)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Append one record to the in-process buffer. It reaches the file with
    /// the next [`append`](Self::append), [`sync`](Self::sync) or a full buffer.
    pub(crate) fn append_buffered(&mut self, record: &JournalRecord) -> Result<(), CacheError> {
        write_record(&mut self.writer, record)
    }

    /// Force appended records to stable storage
    pub(crate) fn sync(&mut self) -> Result<(), CacheError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn write_record(writer: &mut BufWriter<File>, record: &impl Serialize) -> Result<(), CacheError> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// A replacement journal being written next to the live one.
///
/// The snapshot is synced by [`begin`](Self::begin); records appended after
/// that are the ones the live journal received in the meantime.
pub(crate) struct Compaction {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    directory: PathBuf,
}

impl Compaction {
    pub(crate) fn begin<'a>(
        directory: &Path,
        tmp_name: &str,
        entries: impl IntoIterator<Item = (&'a CacheKey, &'a IndexEntry)>,
    ) -> Result<Self, CacheError> {
        let tmp_path = directory.join(tmp_name);
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let header = JournalHeader {
            magic: JOURNAL_MAGIC.to_string(),
            version: JOURNAL_VERSION,
        };
        write_record(&mut writer, &header)?;

        let mut count = 0usize;
        for (key, entry) in entries {
            write_record(
                &mut writer,
                &JournalRecord::Clean {
                    key: key.to_string(),
                    size: entry.size,
                    generation: entry.generation,
                },
            )?;
            count += 1;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        debug!(path = ?tmp_path, entries = count, "Wrote compacted disk cache journal");

        Ok(Self {
            writer,
            tmp_path,
            directory: directory.to_path_buf(),
        })
    }

    pub(crate) fn append(&mut self, record: &JournalRecord) -> Result<(), CacheError> {
        write_record(&mut self.writer, record)
    }

    /// Replace the live journal and open the result for appending
    pub(crate) fn install(mut self) -> Result<Journal, CacheError> {
        self.writer.flush()?;
        fs::rename(&self.tmp_path, self.directory.join(JOURNAL_FILE))?;
        Journal::open_append(&self.directory)
    }

    /// Throw the replacement away, leaving the live journal untouched
    pub(crate) fn discard(self) {
        let Self {
            writer, tmp_path, ..
        } = self;
        drop(writer);
        if let Err(e) = fs::remove_file(&tmp_path) {
            warn!(path = ?tmp_path, error = %e, "Failed to remove abandoned journal");
        }
    }
}
