use crate::fetch::FetchError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    net::SocketAddr,
    num::NonZeroUsize,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

pub const DEFAULT_CONFIG_URL: &str = "https://bdistricting.com/bot/2020.json";
pub const DEFAULT_SOLVER: &str = "districter2";
/// 6 hours
pub const DEFAULT_TIMEOUT_SECS: u64 = 6 * 60 * 60;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid: {0}")]
    InvalidGlobs(#[from] globset::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found: {0}")]
    MetadataNotFound(#[from] Error),
    #[error("{path}: could not read: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("{path}: could not write: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("{path}: bad yaml: {source}")]
    BadYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: bad json: {source}")]
    BadJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not fetch server catalog: {0}")]
    ServerCatalog(#[source] FetchError),
}

/// Runner settings, read from a YAML file and overridden by command line flags
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // everything else defaults to a directory below this one
    #[serde(default = "default_client_dir")]
    pub client_dir: PathBuf,
    /// datasets and job definitions, default `<client>/data`
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// run directories and journals, default `<client>/work`
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// solver binaries, default `<client>/bin`
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// concurrent solver runs, default is the available parallelism
    #[serde(default)]
    pub threads: Option<usize>,

    #[serde(default = "default_config_url")]
    pub config_url: String,
    /// never fetch the server catalog
    #[serde(default)]
    pub local: bool,
    /// run the solver without `-nice 19`
    #[serde(default)]
    pub full_priority: bool,
    /// status server listen address, e.g. 127.0.0.1:8080
    #[serde(default)]
    pub http: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_solver")]
    pub solver: String,
    /// job name globs, empty runs every enabled job
    #[serde(default)]
    pub jobs: Vec<String>,
}

fn default_client_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_config_url() -> String {
    DEFAULT_CONFIG_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_solver() -> String {
    DEFAULT_SOLVER.to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            client_dir: default_client_dir(),
            data_dir: None,
            work_dir: None,
            bin_dir: None,
            threads: None,
            config_url: default_config_url(),
            local: false,
            full_priority: false,
            http: None,
            timeout_secs: default_timeout_secs(),
            solver: default_solver(),
            jobs: Vec::new(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&raw).map_err(|source| ConfigErrors::BadYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.client_dir.join("data"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.client_dir.join("work"))
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.bin_dir
            .clone()
            .unwrap_or_else(|| self.client_dir.join("bin"))
    }

    pub fn solver_path(&self) -> PathBuf {
        self.bin_dir().join(&self.solver)
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// parsed status server address, if one is configured
    pub fn http_addr(&self) -> Option<Result<SocketAddr, std::net::AddrParseError>> {
        self.http.as_deref().map(str::parse)
    }

    /// log every problem at once, returns true if any was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;
        let solver = self.solver_path();

        match check_executable(&solver) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Solver target {} is not executable",
                    solver.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to find solver {}. Either not a file or not found: {e}",
                    solver.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.threads() == 0 {
            error!("threads cannot be 0, nothing would ever run");
            contains_error = true;
        }

        if self.timeout_secs == 0 {
            error!("timeout_secs cannot be 0, every run would be killed right away");
            contains_error = true;
        }

        if !self.local && self.config_url.is_empty() {
            error!("config_url is empty, set it or run with --local");
            contains_error = true;
        }

        if let Some(Err(e)) = self.http_addr() {
            error!("http ({:?}) is not a valid listen address: {e}", self.http);
            contains_error = true;
        }

        if self.local && self.config_url != DEFAULT_CONFIG_URL {
            warn!("config_url is ignored in local mode");
        }

        contains_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn solver_in(dir: &Path, mode: u32) {
        let bin = dir.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let solver = bin.join(DEFAULT_SOLVER);
        fs::write(&solver, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&solver, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn defaults_hang_off_client_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        fs::write(&path, "client_dir: /srv/bot\nthreads: 3\njobs: [\"NC_*\"]\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();

        assert_eq!(config.data_dir(), PathBuf::from("/srv/bot/data"));
        assert_eq!(config.work_dir(), PathBuf::from("/srv/bot/work"));
        assert_eq!(config.solver_path(), PathBuf::from("/srv/bot/bin/districter2"));
        assert_eq!(config.threads(), 3);
        assert_eq!(config.timeout(), Duration::from_secs(21600));
        assert_eq!(config.config_url, DEFAULT_CONFIG_URL);
        assert_eq!(config.jobs, ["NC_*"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        fs::write(&path, "thread: 3\n").unwrap();

        assert!(matches!(
            RunnerConfig::load(&path),
            Err(ConfigErrors::BadYaml { .. })
        ));
    }

    #[test]
    fn preflight_accepts_executable_solver() {
        let dir = tempfile::tempdir().unwrap();
        solver_in(dir.path(), 0o755);
        let config = RunnerConfig {
            client_dir: dir.path().to_path_buf(),
            threads: Some(2),
            ..Default::default()
        };

        assert!(!config.preflight_checks());
    }

    #[test]
    fn preflight_flags_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        solver_in(dir.path(), 0o644);
        let config = RunnerConfig {
            client_dir: dir.path().to_path_buf(),
            threads: Some(0),
            http: Some("not an address".into()),
            ..Default::default()
        };

        assert_eq!(check_executable(&config.solver_path()).unwrap(), false);
        assert!(config.preflight_checks());
    }

    #[test]
    fn missing_solver_is_not_found() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            check_executable(&dir.path().join("districter2")),
            Err(ConfigErrors::FileNotFound(_))
        ));
    }
}
