use clap::Parser;
use solverbot_runner::{
    catalog::{
        self,
        args::{job_command_args, shell_escape},
        CatalogSources, JobSet,
    },
    config::{ConfigErrors, RunnerConfig},
    fetch::http_client,
    ledger::{Ledger, LedgerError},
    scheduler::{Exit, Scheduler, SchedulerSettings},
    statlog::{open_any, summarize},
    status::{StatusServer, StatusSource},
    supervisor::stdout_sink,
};
use std::{
    env,
    ffi::CString,
    fs,
    io::{self, BufReader},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("failed to open result journal: {0}")]
    Ledger(#[from] LedgerError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("{path}: could not create work dir: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("preflight checks failed, see above")]
    Preflight,
}

/// Runs a solver over and over on weighted random jobs and sends in the best results
#[derive(Parser, Debug)]
#[command(name = "solverbot-runner", version)]
struct Cli {
    /// YAML settings file, flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// url to fetch the bot catalog json from
    #[arg(long)]
    url: Option<String>,

    /// client dir, data/work/bin default to directories below it
    #[arg(long)]
    dir: Option<PathBuf>,

    #[arg(long)]
    data: Option<PathBuf>,

    #[arg(long)]
    work: Option<PathBuf>,

    #[arg(long)]
    bin: Option<PathBuf>,

    /// serve status json on this address, e.g. :8080 or 127.0.0.1:8080
    #[arg(long)]
    http: Option<String>,

    /// number of solvers to run at once
    #[arg(long)]
    threads: Option<usize>,

    /// don't fetch the server catalog
    #[arg(long)]
    local: bool,

    #[arg(short, long)]
    verbose: bool,

    /// run without `nice`
    #[arg(long = "full-prio")]
    full_priority: bool,

    /// print the command line of every job and exit
    #[arg(long)]
    print_all_commands: bool,

    /// print the best local score of every job and exit
    #[arg(long)]
    show_best: bool,

    /// only serve status, start no solvers
    #[arg(long)]
    no_run: bool,

    /// print the summary of a statlog (or statlog.gz) and exit
    #[arg(long, value_name = "STATLOG")]
    summarize: Option<PathBuf>,

    /// only run jobs whose name matches one of these globs
    jobs: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut RunnerConfig) {
        if let Some(dir) = &self.dir {
            config.client_dir = dir.clone();
        }
        if let Some(data) = &self.data {
            config.data_dir = Some(data.clone());
        }
        if let Some(work) = &self.work {
            config.work_dir = Some(work.clone());
        }
        if let Some(bin) = &self.bin {
            config.bin_dir = Some(bin.clone());
        }
        if let Some(url) = &self.url {
            config.config_url = url.clone();
        }
        if let Some(http) = &self.http {
            // a bare ":8080" listens on every interface
            config.http = Some(match http.strip_prefix(':') {
                Some(port) => format!("0.0.0.0:{port}"),
                None => http.clone(),
            });
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        config.local |= self.local;
        config.full_priority |= self.full_priority;
        if !self.jobs.is_empty() {
            config.jobs = self.jobs.clone();
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        }))
        .with_writer(io::stderr)
        .init();

    if let Some(statlog) = &cli.summarize {
        return print_summary(statlog);
    }

    let mut config = match &cli.config {
        Some(path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                error!(error = ?error, "Failed to load settings: {error}");
                return ExitCode::FAILURE;
            }
        },
        None => RunnerConfig::default(),
    };
    cli.apply(&mut config);

    match run(&cli, &config) {
        Ok(Exit::Restart) => {
            let error = exec_self();
            error!(error = ?error, "Failed to restart: {error}");
            ExitCode::FAILURE
        }
        Ok(Exit::Stopped) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &RunnerConfig) -> Result<Exit, RunError> {
    let work_dir = config.work_dir();
    fs::create_dir_all(&work_dir).map_err(|source| RunError::WorkDir {
        path: work_dir.clone(),
        source,
    })?;

    let ledger = Ledger::open(&work_dir)?;

    if cli.show_best {
        for (name, score) in ledger.list() {
            println!("{name}\t{:.6}", score.kmpp);
        }
        return Ok(Exit::Stopped);
    }

    let client = http_client()?;
    let data_dir = config.data_dir();
    let catalog = catalog::assemble(
        &CatalogSources {
            data_dir: &data_dir,
            work_dir: &work_dir,
            config_url: &config.config_url,
            local: config.local,
        },
        &client,
    )?;
    let jobs = JobSet::select(&catalog, &config.jobs)?;
    info!(
        enabled = jobs.len(),
        total = catalog.jobs.len(),
        weight = jobs.weight_sum(),
        "Jobs selected"
    );

    if cli.print_all_commands {
        for job in jobs.jobs() {
            let command = job_command_args(job, &data_dir, config.full_priority)
                .iter()
                .map(|arg| shell_escape(arg).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "{}: (cd {} && {} {command})",
                job.name,
                work_dir.join(&job.name).display(),
                config.solver_path().display()
            );
        }
        return Ok(Exit::Stopped);
    }

    if !cli.no_run && config.preflight_checks() {
        return Err(RunError::Preflight);
    }

    let scheduler = Scheduler::new(
        SchedulerSettings::from_config(config),
        catalog,
        jobs,
        Arc::new(ledger),
        client,
        stdout_sink(),
    );
    watch_signals(scheduler.clone());

    let status = match config.http_addr() {
        Some(Ok(addr)) => {
            let source: Arc<dyn StatusSource> = scheduler.clone();
            match StatusServer::start(addr, source) {
                Ok(server) => Some(server),
                Err(error) => {
                    error!(error = ?error, "{error}");
                    None
                }
            }
        }
        Some(Err(error)) => {
            warn!(error = ?error, "Not serving status: {error}");
            None
        }
        None => None,
    };

    if cli.no_run {
        if status.is_none() {
            return Ok(Exit::Stopped);
        }
        // serve until interrupted
        while !scheduler.is_stopping() {
            thread::park_timeout(Duration::from_secs(1));
        }
        return Ok(Exit::Stopped);
    }

    let exit = scheduler.run();
    if let Some(status) = status {
        status.stop();
    }
    info!(exit = ?exit, "Run loop finished");

    Ok(exit)
}

/// first interrupt drains, the second one kills running solvers
fn watch_signals(scheduler: Arc<Scheduler>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            warn!(error = ?error, "Interrupts will not be handled: {error}");
            return;
        }
    };

    let spawned = thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("Interrupted, waiting for running solvers, interrupt again to kill them");
                scheduler.quit();

                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted again, killing running solvers");
                    scheduler.abort();
                }
            })
        });

    if let Err(error) = spawned {
        warn!(error = ?error, "Interrupts will not be handled: {error}");
    }
}

fn print_summary(path: &Path) -> ExitCode {
    let summary = open_any(path).and_then(|reader| summarize(BufReader::new(reader)));

    match summary {
        Ok(summary) => {
            println!(
                "Km/p={:.6} spread={:.6} std={:.6}",
                summary.score.kmpp, summary.score.spread, summary.score.std
            );
            println!("{}", summary.statsum);
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, path = ?path, "{error}");
            ExitCode::FAILURE
        }
    }
}

/// replace this process with a fresh copy of the current executable, only returns on error
fn exec_self() -> nix::Error {
    let binary = match env::current_exe() {
        Ok(binary) => binary,
        Err(error) => {
            error!(error = ?error, "Could not find own executable: {error}");
            return nix::Error::ENOENT;
        }
    };

    let to_cstring = |raw: &[u8]| CString::new(raw).map_err(|_| nix::Error::EINVAL);
    let path = match to_cstring(binary.as_os_str().as_bytes()) {
        Ok(path) => path,
        Err(error) => return error,
    };
    let args = match env::args_os()
        .map(|arg| to_cstring(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(args) => args,
        Err(error) => return error,
    };

    info!(binary = ?binary, "Restarting");
    match nix::unistd::execv(&path, &args) {
        Ok(never) => match never {},
        Err(error) => error,
    }
}
