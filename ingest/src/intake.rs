use crate::{
    dedup::{digest, DedupError, DedupStore, LOG_NAME},
    pather::ResultPather,
};
use serde_json::Value;
use solverbot_data::{apply_overlays, Catalog, OverlayError, ResultMessage};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    net::{IpAddr, SocketAddr},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument};

pub const CLIENT_CATALOG: &str = "config.json";
pub const SERVER_OVERRIDES: &str = "server.json";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("bad result json: {0}")]
    BadJson(#[source] serde_json::Error),
    #[error("empty result")]
    Empty,
    #[error("{path}: could not create result dir: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: could not write result: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error("{path}: could not read catalog: {source}")]
    ReadCatalog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: bad catalog json: {source}")]
    BadCatalog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not apply overlays: {0}")]
    Overlay(#[from] OverlayError),
}

impl IntakeError {
    /// the sender's fault, answered with 400 instead of 500
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadJson(_) | Self::Empty)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// stored under this path, relative to the result dir
    Stored(PathBuf),
    Duplicate,
}

/// Accepts result submissions into a result dir, each distinct result is stored once
#[derive(Debug)]
pub struct Intake {
    dir: PathBuf,
    seen: DedupStore,
    pather: ResultPather,
}

impl Intake {
    /// opens `<dir>/seen`, a malformed log is fatal
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DedupError> {
        let dir = dir.as_ref().to_path_buf();
        let seen = DedupStore::open(dir.join(LOG_NAME))?;

        Ok(Self {
            dir,
            seen,
            pather: ResultPather::new(),
        })
    }

    pub fn seen(&self) -> &DedupStore {
        &self.seen
    }

    /// store one raw submission from `addr`
    #[instrument(skip(self, raw), fields(len = raw.len()))]
    pub fn accept(&self, raw: &[u8], addr: &str) -> Result<IntakeOutcome, IntakeError> {
        let message: ResultMessage = serde_json::from_slice(raw).map_err(IntakeError::BadJson)?;
        let key = message.dedup_key().ok_or(IntakeError::Empty)?;

        let Some(reservation) = self.seen.reserve(digest(key.as_bytes())) else {
            info!(job = %message.job, "Already received");
            return Ok(IntakeOutcome::Duplicate);
        };

        let relative = self.pather.next_path(&sanitize_addr(addr));
        let path = self.dir.join(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| IntakeError::Dir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_read_only(&path, raw).map_err(|source| IntakeError::Write {
            path: path.clone(),
            source,
        })?;

        reservation.commit()?;
        info!(job = %message.job, score = message.score.kmpp, path = ?relative, "Stored result");

        Ok(IntakeOutcome::Stored(relative))
    }

    /// the client catalog with the server's urls and overlays on top
    pub fn merged_catalog(&self) -> Result<Value, IntakeError> {
        let mut catalog = read_catalog(&self.dir.join(CLIENT_CATALOG))?;
        let server = read_catalog(&self.dir.join(SERVER_OVERRIDES))?;

        if !server.config_url.is_empty() {
            catalog.config_url = server.config_url;
        }
        if !server.post_url.is_empty() {
            catalog.post_url = server.post_url;
        }
        if !server.data_urls.is_empty() {
            catalog.data_urls = server.data_urls;
        }

        let path = self.dir.join(CLIENT_CATALOG);
        let mut merged = serde_json::to_value(&catalog)
            .map_err(|source| IntakeError::BadCatalog { path, source })?;
        apply_overlays(&mut merged, &server.overlays)?;

        Ok(merged)
    }
}

fn read_catalog(path: &Path) -> Result<Catalog, IntakeError> {
    let raw = fs::read(path).map_err(|source| IntakeError::ReadCatalog {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&raw).map_err(|source| IntakeError::BadCatalog {
        path: path.to_path_buf(),
        source,
    })
}

fn write_read_only(path: &Path, raw: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o444)
        .open(path)?;
    file.write_all(raw)?;
    file.sync_data()
}

/// host part of a peer address, safe to use inside a file name
pub fn sanitize_addr(raw: &str) -> String {
    let raw = raw.trim();
    let host = if let Ok(addr) = raw.parse::<SocketAddr>() {
        addr.ip().to_string()
    } else if let Ok(ip) = raw.parse::<IpAddr>() {
        ip.to_string()
    } else {
        match raw.rsplit_once(':') {
            Some((host, _port)) => host.to_string(),
            None => raw.to_string(),
        }
    };

    let safe = host
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect::<String>();
    if safe.is_empty() {
        "unknown".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use solverbot_data::ScoreSummary;
    use std::os::unix::fs::PermissionsExt;

    fn result(solution: &[u8], statsum: &str) -> Vec<u8> {
        let mut message = ResultMessage {
            job: "NC_Congress".into(),
            statsum: statsum.into(),
            score: ScoreSummary {
                kmpp: 41.5,
                spread: 12.0,
                std: 3.0,
            },
            ok: true,
            ..Default::default()
        };
        if !solution.is_empty() {
            message.set_solution(solution);
        }
        serde_json::to_vec(&message).unwrap()
    }

    #[test]
    fn stores_then_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::open(dir.path()).unwrap();
        let raw = result(b"solution", "#Best Km/p: Km/p=41.5");

        let IntakeOutcome::Stored(relative) = intake.accept(&raw, "10.1.2.3:5555").unwrap() else {
            panic!("first submission should be stored");
        };
        let stored = dir.path().join(&relative);
        assert_eq!(fs::read(&stored).unwrap(), raw);
        assert_eq!(
            fs::metadata(&stored).unwrap().permissions().mode() & 0o777,
            0o444
        );
        let name = relative.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("_10.1.2.3_"), "{name}");

        // same solution, different summary
        let again = result(b"solution", "other");
        assert_eq!(
            intake.accept(&again, "10.1.2.4:1").unwrap(),
            IntakeOutcome::Duplicate
        );

        let reopened = Intake::open(dir.path()).unwrap();
        assert_eq!(
            reopened.accept(&raw, "10.1.2.3:5555").unwrap(),
            IntakeOutcome::Duplicate
        );
    }

    #[test]
    fn statsum_is_the_key_without_a_solution() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::open(dir.path()).unwrap();

        assert!(matches!(
            intake.accept(&result(b"", "summary a"), "1.1.1.1").unwrap(),
            IntakeOutcome::Stored(_)
        ));
        assert!(matches!(
            intake.accept(&result(b"", "summary b"), "1.1.1.1").unwrap(),
            IntakeOutcome::Stored(_)
        ));
        assert_eq!(
            intake.accept(&result(b"", "summary a"), "1.1.1.1").unwrap(),
            IntakeOutcome::Duplicate
        );
    }

    #[test]
    fn accepts_results_with_only_a_solution() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::open(dir.path()).unwrap();
        let raw = br##"{"vars":{"config":"NC_Congress"},"bestKmpp.dsz":"c29sdXRpb24=","binlog":"","statsum":"#Best"}"##;

        let IntakeOutcome::Stored(relative) = intake.accept(raw, "10.1.2.3:5555").unwrap() else {
            panic!("a bare solution should be stored");
        };
        assert_eq!(fs::read(dir.path().join(relative)).unwrap(), raw);
        assert_eq!(
            intake.seen().state(&digest(b"c29sdXRpb24=")),
            Some(crate::dedup::EntryState::Committed)
        );
    }

    #[test]
    fn rejects_empty_and_malformed_results() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::open(dir.path()).unwrap();

        let empty = intake.accept(&result(b"", ""), "1.1.1.1").unwrap_err();
        assert!(matches!(empty, IntakeError::Empty));
        assert!(empty.is_bad_request());

        let garbage = intake.accept(b"{nope", "1.1.1.1").unwrap_err();
        assert!(matches!(garbage, IntakeError::BadJson(_)));
        assert!(garbage.is_bad_request());
        assert_eq!(intake.seen().committed_len(), 0);
    }

    #[test]
    fn failed_write_releases_the_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::open(dir.path()).unwrap();
        let raw = result(b"solution", "");
        // the day directory can not be created under a plain file
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        fs::write(dir.path().join(&today), "").unwrap();

        let error = intake.accept(&raw, "1.1.1.1").unwrap_err();
        assert!(matches!(error, IntakeError::Dir { .. }));
        assert!(!error.is_bad_request());
        assert_eq!(intake.seen().state(&digest(b"c29sdXRpb24=")), None);

        fs::remove_file(dir.path().join(&today)).unwrap();
        assert!(matches!(
            intake.accept(&raw, "1.1.1.1").unwrap(),
            IntakeOutcome::Stored(_)
        ));
    }

    #[test]
    fn addresses_are_path_safe() {
        assert_eq!(sanitize_addr("10.0.0.1:443"), "10.0.0.1");
        assert_eq!(sanitize_addr("10.0.0.1"), "10.0.0.1");
        assert_eq!(sanitize_addr("[2001:db8::1]:443"), "2001_db8__1");
        assert_eq!(sanitize_addr("2001:db8::1"), "2001_db8__1");
        assert_eq!(sanitize_addr("host.example:80"), "host.example");
        assert_eq!(sanitize_addr("../../etc"), ".._.._etc");
        assert_eq!(sanitize_addr(""), "unknown");
    }

    #[test]
    fn server_settings_override_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CLIENT_CATALOG),
            json!({
                "c": {"NC_Congress": {"st": "NC", "name": "NC_Congress"}},
                "url": "https://old/bot.json",
                "post": "https://old/put",
                "durls": {"NC": "https://old/NC.tar.gz", "TX": "https://old/TX.tar.gz"}
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join(SERVER_OVERRIDES),
            json!({
                "post": "https://new/put",
                "durls": {"NC": "https://new/NC.tar.gz"},
                "overlays": {"c.NC_Congress.weight": 2.5, "extra.flag": true}
            })
            .to_string(),
        )
        .unwrap();

        let intake = Intake::open(dir.path()).unwrap();
        let merged = intake.merged_catalog().unwrap();

        assert_eq!(merged["url"], "https://old/bot.json");
        assert_eq!(merged["post"], "https://new/put");
        assert_eq!(merged["durls"], json!({"NC": "https://new/NC.tar.gz"}));
        assert_eq!(merged["c"]["NC_Congress"]["weight"], 2.5);
        assert_eq!(merged["extra"]["flag"], true);
    }

    #[test]
    fn bad_server_settings_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CLIENT_CATALOG), "{}").unwrap();
        fs::write(dir.path().join(SERVER_OVERRIDES), "{broken").unwrap();

        let intake = Intake::open(dir.path()).unwrap();
        assert!(matches!(
            intake.merged_catalog(),
            Err(IntakeError::BadCatalog { .. })
        ));
    }
}
