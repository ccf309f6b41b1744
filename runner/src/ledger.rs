use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use solverbot_data::ScoreSummary;
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// journal of every finished run, in the work dir
pub const JOURNAL_NAME: &str = "bestdb";
/// journal of every submitted score, in the work dir
pub const SENT_NAME: &str = "sentdb";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{path}: failed to open: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line} bad json: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: failed to append: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode journal entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One finished run, as appended to the journal
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct FinishRecord {
    #[serde(rename = "n")]
    pub job: String,
    /// start, epoch milliseconds
    #[serde(rename = "s")]
    pub started: i64,
    /// finish, epoch milliseconds
    #[serde(rename = "t")]
    pub finished: i64,
    /// run time in seconds
    #[serde(rename = "r")]
    pub seconds: f64,
    #[serde(rename = "d")]
    pub workdir: PathBuf,
    #[serde(rename = "b")]
    pub score: ScoreSummary,
    pub ok: bool,
}

impl FinishRecord {
    pub fn new(
        job: &str,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        workdir: &Path,
        score: ScoreSummary,
        ok: bool,
    ) -> Self {
        Self {
            job: job.to_string(),
            started: started.timestamp_millis(),
            finished: finished.timestamp_millis(),
            seconds: (finished - started).num_milliseconds() as f64 / 1000.0,
            workdir: workdir.to_path_buf(),
            score,
            ok,
        }
    }

    /// true if this record should replace `previous` as the best for its job
    fn improves(&self, previous: Option<&FinishRecord>) -> bool {
        self.ok
            && self.score.is_qualifying()
            && previous.map_or(true, |previous| self.score.beats(&previous.score))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
struct SentRecord {
    #[serde(rename = "n")]
    job: String,
    #[serde(rename = "b")]
    score: ScoreSummary,
    /// epoch milliseconds
    #[serde(rename = "t")]
    timestamp: i64,
}

#[derive(Debug)]
struct LedgerState {
    journal: File,
    sent_log: File,
    bests: BTreeMap<String, FinishRecord>,
    sent: BTreeMap<String, ScoreSummary>,
}

/// Best result per job, backed by append-only journals
///
/// The in-memory best-by-name map is rebuilt at open time by folding over the journal,
/// only successful runs with a qualifying score take part.
#[derive(Debug)]
pub struct Ledger {
    journal_path: PathBuf,
    sent_path: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// open (or create) the journals in `dir`
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        Self::open_paths(dir.join(JOURNAL_NAME), dir.join(SENT_NAME))
    }

    pub fn open_paths(journal_path: PathBuf, sent_path: PathBuf) -> Result<Self, LedgerError> {
        let mut bests = BTreeMap::new();
        let journal_entries = replay(&journal_path, |record: FinishRecord| {
            if record.improves(bests.get(&record.job)) {
                bests.insert(record.job.clone(), record);
            }
        })?;

        let mut sent = BTreeMap::new();
        let sent_entries = replay(&sent_path, |record: SentRecord| {
            if lowers_sent(sent.get(&record.job), &record.score) {
                sent.insert(record.job, record.score);
            }
        })?;

        info!(
            journal = ?journal_path,
            "Loaded {journal_entries} finished runs and {sent_entries} submissions, best known for {} jobs",
            bests.len()
        );

        Ok(Self {
            state: Mutex::new(LedgerState {
                journal: append(&journal_path)?,
                sent_log: append(&sent_path)?,
                bests,
                sent,
            }),
            journal_path,
            sent_path,
        })
    }

    /// journal a finished run, returns true if it became the new best for its job
    pub fn record_finish(&self, record: FinishRecord) -> Result<bool, LedgerError> {
        let line = encode_line(&record)?;
        let mut state = self.state.lock();

        state
            .journal
            .write_all(&line)
            .map_err(|source| LedgerError::Write {
                path: self.journal_path.clone(),
                source,
            })?;

        if record.improves(state.bests.get(&record.job)) {
            debug!(job = %record.job, kmpp = record.score.kmpp, "New local best");
            state.bests.insert(record.job.clone(), record);

            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// current best score for a job
    pub fn get(&self, job: &str) -> Option<ScoreSummary> {
        self.state.lock().bests.get(job).map(|record| record.score)
    }

    pub fn list(&self) -> BTreeMap<String, ScoreSummary> {
        self.state
            .lock()
            .bests
            .iter()
            .map(|(name, record)| (name.clone(), record.score))
            .collect()
    }

    pub fn list_full(&self) -> BTreeMap<String, FinishRecord> {
        self.state.lock().bests.clone()
    }

    /// remember that `score` was submitted for `job`, trivial scores are logged but never become the mark
    pub fn mark_sent(&self, job: &str, score: ScoreSummary) -> Result<(), LedgerError> {
        let line = encode_line(&SentRecord {
            job: job.to_string(),
            score,
            timestamp: Utc::now().timestamp_millis(),
        })?;
        let mut state = self.state.lock();

        state
            .sent_log
            .write_all(&line)
            .map_err(|source| LedgerError::Write {
                path: self.sent_path.clone(),
                source,
            })?;

        if lowers_sent(state.sent.get(job), &score) {
            state.sent.insert(job.to_string(), score);
        }

        Ok(())
    }

    /// lowest score ever submitted for a job
    pub fn sent(&self, job: &str) -> Option<ScoreSummary> {
        self.state.lock().sent.get(job).copied()
    }
}

fn lowers_sent(previous: Option<&ScoreSummary>, score: &ScoreSummary) -> bool {
    score.is_qualifying() && previous.map_or(true, |previous| score.beats(previous))
}

fn encode_line<T: Serialize>(record: &T) -> Result<Vec<u8>, LedgerError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    Ok(line)
}

fn append(path: &Path) -> Result<File, LedgerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LedgerError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// feed every json line of `path` to `apply`, a missing file is an empty journal
fn replay<T: DeserializeOwned>(path: &Path, mut apply: impl FnMut(T)) -> Result<usize, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(LedgerError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut entries = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LedgerError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let record = serde_json::from_str(&line).map_err(|source| LedgerError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        apply(record);
        entries += 1;
    }

    Ok(entries)
}
