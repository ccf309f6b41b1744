use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

pub const LOG_NAME: &str = "seen";

/// sha256 of a submission's dedup key
pub type Digest = [u8; 32];

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("{path}: could not open dedup log: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: bad dedup entry: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("{path}: could not append to dedup log: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("hash {0} is not pending")]
    NotPending(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// reserved by a request that has not stored its payload yet
    Pending,
    /// stored and written to the log
    Committed,
}

#[derive(Debug)]
struct Entries {
    states: HashMap<Digest, EntryState>,
    log: File,
}

/// Set of every result hash ever received, persisted as one base64 line per hash
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

pub fn digest(key: &[u8]) -> Digest {
    Sha256::digest(key).into()
}

fn encode(hash: &Digest) -> String {
    STANDARD.encode(hash)
}

impl DedupStore {
    /// replay the log at `path` and keep it open for appending, a missing log is an empty store
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DedupError> {
        let path = path.as_ref().to_path_buf();
        let states = match File::open(&path) {
            Ok(file) => replay(&path, file)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(DedupError::Open { path, source }),
        };

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| DedupError::Open {
                path: path.clone(),
                source,
            })?;

        info!(path = ?path, entries = states.len(), "Loaded dedup log");

        Ok(Self {
            path,
            entries: Mutex::new(Entries { states, log }),
        })
    }

    pub fn state(&self, hash: &Digest) -> Option<EntryState> {
        self.entries.lock().states.get(hash).copied()
    }

    pub fn committed_len(&self) -> usize {
        self.entries
            .lock()
            .states
            .values()
            .filter(|state| **state == EntryState::Committed)
            .count()
    }

    /// `true` if the hash was already seen or is in flight, otherwise it is now pending
    pub fn try_reserve(&self, hash: &Digest) -> bool {
        let mut entries = self.entries.lock();
        if entries.states.contains_key(hash) {
            return true;
        }
        entries.states.insert(*hash, EntryState::Pending);

        false
    }

    /// make a pending hash durable, the log line is written before the state changes
    pub fn commit(&self, hash: &Digest) -> Result<(), DedupError> {
        let mut entries = self.entries.lock();
        if entries.states.get(hash) != Some(&EntryState::Pending) {
            return Err(DedupError::NotPending(encode(hash)));
        }

        let line = format!("{}\n", encode(hash));
        entries
            .log
            .write_all(line.as_bytes())
            .and_then(|_| entries.log.flush())
            .map_err(|source| DedupError::Write {
                path: self.path.clone(),
                source,
            })?;
        entries.states.insert(*hash, EntryState::Committed);

        Ok(())
    }

    /// forget a pending hash, committed hashes are never removed
    pub fn rollback(&self, hash: &Digest) {
        let mut entries = self.entries.lock();
        if entries.states.get(hash) == Some(&EntryState::Pending) {
            entries.states.remove(hash);
            debug!(hash = %encode(hash), "Rolled back reservation");
        }
    }

    /// scoped `try_reserve`, `None` for duplicates
    pub fn reserve(&self, hash: Digest) -> Option<Reservation<'_>> {
        if self.try_reserve(&hash) {
            return None;
        }

        Some(Reservation {
            store: self,
            hash,
            committed: false,
        })
    }
}

fn replay(path: &Path, file: File) -> Result<HashMap<Digest, EntryState>, DedupError> {
    let mut states = HashMap::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| DedupError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let malformed = |reason: String| DedupError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            reason,
        };
        let raw = STANDARD
            .decode(line)
            .map_err(|error| malformed(error.to_string()))?;
        let hash: Digest = raw
            .try_into()
            .map_err(|raw: Vec<u8>| malformed(format!("{} byte digest", raw.len())))?;

        states.insert(hash, EntryState::Committed);
    }

    Ok(states)
}

/// A pending hash that rolls back when dropped without `commit`
#[derive(Debug)]
pub struct Reservation<'a> {
    store: &'a DedupStore,
    hash: Digest,
    committed: bool,
}

impl Reservation<'_> {
    pub fn hash(&self) -> &Digest {
        &self.hash
    }

    pub fn commit(mut self) -> Result<(), DedupError> {
        self.store.commit(&self.hash)?;
        self.committed = true;

        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.rollback(&self.hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs,
        sync::{Arc, Barrier},
        thread,
    };

    fn store() -> (tempfile::TempDir, DedupStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::open(dir.path().join(LOG_NAME)).unwrap();
        (dir, store)
    }

    #[test]
    fn concurrent_reserve_admits_one() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let hash = digest(b"solution");
        let barrier = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.try_reserve(&hash)
                })
            })
            .collect::<Vec<_>>();
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|duplicate| !duplicate)
            .count();

        assert_eq!(accepted, 1);
        assert_eq!(store.state(&hash), Some(EntryState::Pending));
    }

    #[test]
    fn commit_survives_reload() {
        let (dir, store) = store();
        let hash = digest(b"solution");

        assert!(!store.try_reserve(&hash));
        store.commit(&hash).unwrap();
        assert!(store.try_reserve(&hash));
        drop(store);

        let reloaded = DedupStore::open(dir.path().join(LOG_NAME)).unwrap();
        assert_eq!(reloaded.state(&hash), Some(EntryState::Committed));
        assert_eq!(reloaded.committed_len(), 1);
        assert!(reloaded.try_reserve(&hash));
    }

    #[test]
    fn rollback_frees_the_hash() {
        let (dir, store) = store();
        let hash = digest(b"statsum only");

        assert!(!store.try_reserve(&hash));
        store.rollback(&hash);
        assert_eq!(store.state(&hash), None);
        assert!(!store.try_reserve(&hash));

        // nothing was persisted
        assert_eq!(fs::read_to_string(dir.path().join(LOG_NAME)).unwrap(), "");
    }

    #[test]
    fn commit_needs_a_pending_hash() {
        let (_dir, store) = store();
        let hash = digest(b"never reserved");

        assert!(matches!(store.commit(&hash), Err(DedupError::NotPending(_))));

        store.try_reserve(&hash);
        store.commit(&hash).unwrap();
        assert!(matches!(store.commit(&hash), Err(DedupError::NotPending(_))));
    }

    #[test]
    fn dropped_reservation_rolls_back() {
        let (_dir, store) = store();
        let hash = digest(b"solution");

        {
            let reservation = store.reserve(hash).unwrap();
            assert!(store.reserve(hash).is_none());
            assert_eq!(reservation.hash(), &hash);
        }
        assert_eq!(store.state(&hash), None);

        store.reserve(hash).unwrap().commit().unwrap();
        assert_eq!(store.state(&hash), Some(EntryState::Committed));
        assert!(store.reserve(hash).is_none());
    }

    #[test]
    fn log_is_one_base64_line_per_hash() {
        let (dir, store) = store();
        for key in [&b"a"[..], b"b"] {
            store.reserve(digest(key)).unwrap().commit().unwrap();
        }

        let log = fs::read_to_string(dir.path().join(LOG_NAME)).unwrap();
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], STANDARD.encode(digest(b"a")));
    }

    #[test]
    fn malformed_log_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_NAME);
        fs::write(
            &path,
            format!("{}\n\nc2hvcnQ=\n", STANDARD.encode(digest(b"a"))),
        )
        .unwrap();

        match DedupStore::open(&path) {
            Err(DedupError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed log, got {other:?}"),
        }

        fs::write(&path, "not base64!\n").unwrap();
        assert!(matches!(
            DedupStore::open(&path),
            Err(DedupError::Malformed { line: 1, .. })
        ));
    }
}
