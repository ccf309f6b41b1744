pub mod archive;
pub mod tail;


use archive::{ArchiveError, ArchivingPipe};
use flate2::read::GzDecoder;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use solverbot_data::ScoreSummary;
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Read},
    num::ParseFloatError,
    path::{Path, PathBuf},
};
use tail::TailBuffer;
use thiserror::Error;
use tracing::{debug, warn};
use tracing_unwrap::ResultExt;

/// lines kept for diagnostics when no best score was found
pub const TAIL_LINES: usize = 50;
/// prefix of the summary lines the solver writes at the end of a run
pub const SUMMARY_MARKER: u8 = b'#';

// #Best Km/p: Km/p=41.261278 spread=1535.000000 std=424.780999 gen=50983
static BEST_SCORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Best Km/p: Km/p=([0-9.]+)\s+spread=([0-9.]+)\s+std=([0-9.]+)")
        .expect_or_log("best score pattern must compile")
});

#[derive(Debug, Error)]
pub enum StatlogError {
    #[error("best Km/p not found")]
    NotFound {
        /// last `TAIL_LINES` lines of the log, joined with newlines
        tail: String,
    },
    #[error("malformed best Km/p line, {field}={value:?}: {source}")]
    Malformed {
        field: &'static str,
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("failed to read statlog: {0}")]
    Read(#[from] io::Error),
    #[error("{path}: failed to open statlog: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: failed to archive statlog: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },
}

/// What a statlog scan found
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub score: ScoreSummary,
    /// the `#` prefixed summary lines seen up to the best score line
    pub statsum: String,
}

/// scan a statlog for the best score line, stopping at the first hit
///
/// The rest of the input is left unread.
pub fn summarize<R: BufRead>(mut input: R) -> Result<Summary, StatlogError> {
    let mut tail = TailBuffer::new(TAIL_LINES);
    let mut summary_lines = Vec::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if input.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }

        let line = String::from_utf8_lossy(&raw).into_owned();
        if raw.first() == Some(&SUMMARY_MARKER) {
            summary_lines.push(line.clone());
        }

        if let Some(captures) = BEST_SCORE.captures(&line) {
            let field = |index: usize, name: &'static str| {
                let value = &captures[index];
                value
                    .parse::<f64>()
                    .map_err(|source| StatlogError::Malformed {
                        field: name,
                        value: value.to_string(),
                        source,
                    })
            };

            let score = ScoreSummary {
                kmpp: field(1, "Km/p")?,
                spread: field(2, "spread")?,
                std: field(3, "std")?,
            };

            return Ok(Summary {
                score,
                statsum: summary_lines.iter().join("\n"),
            });
        }

        tail.push(line);
    }

    let tail = tail.lines().join("\n");
    Err(StatlogError::NotFound { tail })
}

/// summarize `statlog` while compressing it to `statlog.gz`, then remove the original
///
/// The log is archived and removed even when no best score line was found.
pub fn archive_and_summarize(statlog: &Path) -> Result<Summary, StatlogError> {
    let open = |path: &Path, result: io::Result<File>| {
        result.map_err(|source| StatlogError::Open {
            path: path.to_path_buf(),
            source,
        })
    };
    let archive_path = gz_path(statlog);

    let source = open(statlog, File::open(statlog))?;
    let sink = open(&archive_path, File::create(&archive_path))?;
    let mut pipe = ArchivingPipe::new(source, sink);

    let summary = summarize(BufReader::new(&mut pipe));

    let archived = pipe
        .finish()
        .and_then(|file| file.sync_all().map_err(ArchiveError::Sink));
    match archived {
        Ok(()) => {
            if let Err(error) = fs::remove_file(statlog) {
                warn!(error = ?error, path = ?statlog, "Failed to remove archived statlog: {error}");
            }
            debug!(path = ?archive_path, "Archived statlog");
        }
        Err(source) => {
            // keep the uncompressed original, the archive is incomplete
            return Err(StatlogError::Archive {
                path: archive_path,
                source,
            });
        }
    }

    summary
}

/// open a statlog for reading, transparently decompressing `.gz` archives
pub fn open_any(path: &Path) -> Result<Box<dyn Read + Send>, StatlogError> {
    let file = File::open(path).map_err(|source| StatlogError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    if path.extension().is_some_and(|extension| extension == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}
