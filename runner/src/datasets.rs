use crate::{
    catalog::args::dataset_path,
    fetch::{maybe_fetch, FetchError},
};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use solverbot_data::{Catalog, Job};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tar::{Archive, EntryType};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// dataset archives are re-fetched after a year
pub const ARCHIVE_MAX_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no dataset url for region {region}")]
    NoUrl { region: String },
    #[error("could not download dataset for {region}: {source}")]
    Fetch {
        region: String,
        #[source]
        source: FetchError,
    },
    #[error("{path}: bad dataset archive: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{archive}: {entry} does not unpack inside the data dir")]
    Escapes { archive: PathBuf, entry: String },
    #[error("{path}: dataset still missing after unpacking")]
    Missing { path: PathBuf },
}

/// make sure the region dataset of `job` exists, downloading and unpacking it if not
///
/// Returns the dataset path passed to the solver.
#[instrument(skip_all, fields(job = %job.name), level = "debug")]
pub fn ensure_dataset(
    client: &Client,
    catalog: &Catalog,
    job: &Job,
    data_dir: &Path,
) -> Result<PathBuf, DatasetError> {
    let dataset = dataset_path(data_dir, job);
    if dataset.is_file() {
        return Ok(dataset);
    }

    let url = job
        .data_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .or_else(|| catalog.data_urls.get(&job.region).map(String::as_str))
        .ok_or_else(|| DatasetError::NoUrl {
            region: job.region.clone(),
        })?;

    let archive = data_dir.join(format!("{}.tar.gz", job.region));
    maybe_fetch(client, url, &archive, ARCHIVE_MAX_AGE).map_err(|source| {
        DatasetError::Fetch {
            region: job.region.clone(),
            source,
        }
    })?;

    let unpacked = unpack_archive(&archive, data_dir)?;
    info!(region = %job.region, files = unpacked, "Unpacked dataset");

    if dataset.is_file() {
        Ok(dataset)
    } else {
        Err(DatasetError::Missing { path: dataset })
    }
}

/// unpack the regular files of a `.tar.gz` into `target`, returns how many were written
///
/// Entries that would land outside of `target` reject the whole archive.
pub fn unpack_archive(archive: &Path, target: &Path) -> Result<usize, DatasetError> {
    let bad_archive = |source| DatasetError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(bad_archive)?;
    let mut tar = Archive::new(GzDecoder::new(file));
    let mut unpacked = 0;

    for entry in tar.entries().map_err(bad_archive)? {
        let mut entry = entry.map_err(bad_archive)?;
        let name = entry.path().map_err(bad_archive)?.to_string_lossy().into_owned();

        if entry.header().entry_type() != EntryType::Regular {
            debug!(entry = %name, "Ignoring non regular tar entry");
            continue;
        }

        // false means the entry path tried to leave `target`
        if !entry.unpack_in(target).map_err(bad_archive)? {
            return Err(DatasetError::Escapes {
                archive: archive.to_path_buf(),
                entry: name,
            });
        }
        debug!(entry = %name, "Unpacked");
        unpacked += 1;
    }

    Ok(unpacked)
}
