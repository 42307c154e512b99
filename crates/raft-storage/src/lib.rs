//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's Storage trait, used by raft-node replicas
//! what: FileStorage implementation, re-exported Storage trait and InMemoryStorage

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use raft_core::{LogEntry, NodeId, Term};
use tracing::{debug, warn};

pub use raft_core::storage::{InMemoryStorage, Storage};

const META_FILE: &str = "meta.json";
const META_TEMP: &str = "meta.tmp";
const LOG_FILE: &str = "log.jsonl";
const LOG_TEMP: &str = "log.tmp";

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one json log entry per line, appended and fsynced
///
/// an append that was cut short by a crash leaves at most one partial line
/// at the end of log.jsonl. that append was never acknowledged, so the
/// partial line is dropped when the storage is opened.
///
/// every rename, file creation and removal is followed by an fsync of the
/// directory, so the directory entry is as durable as the file contents.
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            sync_dir(parent)?;
        }
        sync_dir(&dir)?;
        let storage = Self { dir };
        storage.repair_log_tail()?;
        Ok(storage)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// cut a trailing partial line left by an interrupted append
    fn repair_log_tail(&self) -> io::Result<()> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }
        let contents = fs::read(&path)?;
        if contents.is_empty() || contents.ends_with(b"\n") {
            return Ok(());
        }
        let keep = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        warn!(
            path = %path.display(),
            dropped_bytes = contents.len() - keep,
            "discarding partially written log entry"
        );
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(keep as u64)?;
        file.sync_all()
    }

    /// write to a temp file, fsync it, then rename over the target
    fn write_atomically(&self, temp_name: &str, target: &Path, bytes: &[u8]) -> io::Result<()> {
        let temp_path = self.dir.join(temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        sync_dir(&self.dir)
    }

    fn encode_entries(entries: &[LogEntry]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).map_err(invalid_data)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_string_pretty(&meta).map_err(invalid_data)?;
        self.write_atomically(META_TEMP, &self.meta_path(), json.as_bytes())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;

        let meta: MetaData = serde_json::from_str(&contents).map_err(invalid_data)?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let buf = Self::encode_entries(entries)?;
        let path = self.log_path();
        let created = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        if created {
            sync_dir(&self.dir)?;
        }
        debug!(first = entries[0].index, count = entries.len(), "appended log entries");

        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(invalid_data))
            .collect()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let mut log = self.load_log()?;
        let before = log.len();
        log.retain(|e| e.index < from_index);
        if log.len() == before {
            return Ok(());
        }

        let buf = Self::encode_entries(&log)?;
        self.write_atomically(LOG_TEMP, &self.log_path(), &buf)?;
        debug!(from_index, removed = before - log.len(), "truncated log");

        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        sync_dir(&self.dir)
    }
}

/// flush directory entries (creates, renames, removals) to disk
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

// directories cannot be opened for fsync on this platform
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
