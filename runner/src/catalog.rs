pub mod args;

use crate::{config::ConfigErrors, fetch::maybe_fetch};
use globset::{Glob, GlobBuilder, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use rand::Rng;
use reqwest::blocking::Client;
use solverbot_data::{Catalog, Job};
use std::{
    collections::BTreeMap,
    fs, io,
    path::Path,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// catalog as last used, in the work dir
pub const SAVED_CATALOG: &str = "config.json";
/// cached copy of the server catalog, in the work dir
pub const SERVER_CATALOG: &str = "server_config.json";
pub const SERVER_CATALOG_MAX_AGE: Duration = Duration::from_secs(23 * 60 * 60);

/// Where the pieces of the catalog come from
#[derive(Debug, Clone)]
pub struct CatalogSources<'a> {
    pub data_dir: &'a Path,
    pub work_dir: &'a Path,
    pub config_url: &'a str,
    /// skip the server catalog entirely
    pub local: bool,
}

/// read every job definition below `<data>/*/config/*.json`
///
/// A job file that cannot be parsed is fatal, a later file with the same name wins.
pub fn scan_data_dir(data_dir: &Path) -> Result<BTreeMap<String, Job>, ConfigErrors> {
    fs::create_dir_all(data_dir).map_err(|source| ConfigErrors::Write {
        path: data_dir.to_path_buf(),
        source,
    })?;

    let matcher = GlobBuilder::new("*/config/*.json")
        .literal_separator(true)
        .build()?
        .compile_matcher();

    let paths = WalkBuilder::new(data_dir)
        .standard_filters(false)
        .max_depth(Some(3))
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = ?error, "Failed to search data dir for job definitions: {error}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .map(DirEntry::into_path)
        .filter(|path| {
            path.strip_prefix(data_dir)
                .is_ok_and(|relative| matcher.is_match(relative))
        })
        .collect_vec();

    let mut jobs = BTreeMap::new();
    for path in paths {
        let job = read_json::<Job>(&path)?;
        debug!(path = ?path, job = %job.name, "Found job definition");

        if let Some(previous) = jobs.insert(job.name.clone(), job) {
            warn!(path = ?path, job = %previous.name, "Job defined more than once, using the later one");
        }
    }

    Ok(jobs)
}

/// read a catalog file, `None` if it does not exist
pub fn read_catalog(path: &Path) -> Result<Option<Catalog>, ConfigErrors> {
    match read_json(path) {
        Ok(catalog) => Ok(Some(catalog)),
        Err(ConfigErrors::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

pub fn save_catalog(path: &Path, catalog: &Catalog) -> Result<(), ConfigErrors> {
    let blob = serde_json::to_vec_pretty(catalog).map_err(|source| ConfigErrors::BadJson {
        path: path.to_path_buf(),
        source,
    })?;

    let temporary = path.with_extension("json.tmp");
    fs::write(&temporary, blob)
        .and_then(|_| fs::rename(&temporary, path))
        .map_err(|source| ConfigErrors::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the catalog for this run
///
/// Job definitions from the data dir come first, then the saved catalog of the previous
/// run, then (unless local) the server catalog, refreshed when older than a day. The merged
/// result is saved back for the next run.
#[instrument(skip(client), level = "info")]
pub fn assemble(sources: &CatalogSources, client: &Client) -> Result<Catalog, ConfigErrors> {
    let mut catalog = Catalog {
        jobs: scan_data_dir(sources.data_dir)?,
        config_url: sources.config_url.to_string(),
        ..Default::default()
    };

    let saved_path = sources.work_dir.join(SAVED_CATALOG);
    if let Some(saved) = read_catalog(&saved_path)? {
        catalog.merge(saved);
    }
    catalog.normalize();

    if !sources.local {
        let cached = sources.work_dir.join(SERVER_CATALOG);

        match maybe_fetch(client, &catalog.config_url, &cached, SERVER_CATALOG_MAX_AGE) {
            Ok(true) => info!(url = %catalog.config_url, "Refreshed server catalog"),
            Ok(false) => {}
            Err(error) if cached.is_file() => {
                warn!(error = ?error, path = ?cached, "Using stale server catalog: {error}")
            }
            Err(error) => return Err(ConfigErrors::ServerCatalog(error)),
        }

        let server = read_catalog(&cached)?.ok_or_else(|| ConfigErrors::FileNotFound(cached))?;
        catalog.merge(server);
        catalog.normalize();
    }

    save_catalog(&saved_path, &catalog)?;
    info!(jobs = catalog.jobs.len(), "Catalog assembled");

    Ok(catalog)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigErrors> {
    let raw = fs::read(path).map_err(|source| ConfigErrors::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&raw).map_err(|source| ConfigErrors::BadJson {
        path: path.to_path_buf(),
        source,
    })
}

/// The jobs a runner picks from, with their total weight
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    // sorted by name
    jobs: Vec<Job>,
    weight_sum: f64,
}

impl JobSet {
    /// every job that is not disabled
    pub fn new(jobs: impl IntoIterator<Item = Job>) -> Self {
        let jobs = jobs
            .into_iter()
            .filter(|job| !job.disabled)
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect_vec();
        let weight_sum = jobs.iter().map(Job::weight).sum();

        Self { jobs, weight_sum }
    }

    /// enabled catalog jobs whose name matches one of `patterns`, all of them if there are none
    pub fn select(catalog: &Catalog, patterns: &[String]) -> Result<Self, ConfigErrors> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        let filter = builder.build()?;

        let selected = catalog.jobs.values().filter(|job| {
            if job.disabled {
                debug!(job = %job.name, "Disabled");
                false
            } else if !patterns.is_empty() && !filter.is_match(&job.name) {
                debug!(job = %job.name, "Not in current run set");
                false
            } else {
                true
            }
        });

        Ok(Self::new(selected.cloned()))
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn weight_sum(&self) -> f64 {
        self.weight_sum
    }

    /// the job whose weight span contains `draw`, for a draw in `[0, weight_sum)`
    pub fn pick(&self, draw: f64) -> Option<&Job> {
        let mut rest = draw;

        for job in &self.jobs {
            let weight = job.weight();
            if rest < weight {
                return Some(job);
            }
            rest -= weight;
        }

        None
    }

    /// weighted random pick, falls back to a uniform pick if the draw misses every span
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Job> {
        if self.jobs.is_empty() {
            return None;
        }

        let draw = rng.random::<f64>() * self.weight_sum;
        self.pick(draw)
            .or_else(|| self.jobs.get(rng.random_range(0..self.jobs.len())))
            .or_else(|| self.jobs.first())
    }
}
