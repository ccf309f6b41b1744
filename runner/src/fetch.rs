use reqwest::{blocking::Client, StatusCode};
use std::{
    ffi::OsString,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, info};

/// datasets can be large, so this is the whole transfer, not just the connect
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not GET {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url}: unexpected status {status}")]
    Status { url: String, status: StatusCode },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// the blocking client shared by catalog refresh, dataset fetch and result submission
pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("solverbot/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(TRANSFER_TIMEOUT)
        .build()
}

/// download `url` to `path` unless a copy younger than `max_age` is already there
///
/// Returns true if a download happened.
pub fn maybe_fetch(
    client: &Client,
    url: &str,
    path: &Path,
    max_age: Duration,
) -> Result<bool, FetchError> {
    match fs::metadata(path) {
        Ok(metadata) => {
            // unreadable or future mtimes count as fresh
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();

            if age <= max_age {
                debug!(path = ?path, age = ?age, "Cached copy is fresh");
                return Ok(false);
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(FetchError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    download(client, url, path)?;

    Ok(true)
}

/// GET `url` into `path`, going through a `.part` file so a partial download never shows up
pub fn download(client: &Client, url: &str, path: &Path) -> Result<u64, FetchError> {
    let transport = |source| FetchError::Transport {
        url: url.to_string(),
        source,
    };
    debug!(url, path = ?path, "Fetching");

    let mut response = client.get(url).send().map_err(transport)?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let part = part_path(path);
    let io_error = |source| FetchError::Io {
        path: part.clone(),
        source,
    };

    let written = File::create(&part).map_err(io_error).and_then(|mut file| {
        let written = response.copy_to(&mut file).map_err(transport)?;
        file.sync_all().map_err(io_error)?;
        Ok(written)
    });

    let written = match written {
        Ok(written) => written,
        Err(error) => {
            let _ = fs::remove_file(&part);
            return Err(error);
        }
    };

    fs::rename(&part, path).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(url, path = ?path, bytes = written, "Fetched");

    Ok(written)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}
