pub mod window;


use crate::{
    catalog::{args::job_command_args, JobSet},
    config::RunnerConfig,
    datasets::{ensure_dataset, DatasetError},
    ledger::{FinishRecord, Ledger},
    statlog::{archive_and_summarize, StatlogError, Summary},
    status::{RunningRecord, StatusSource},
    submit::Submitter,
    supervisor::{CancelToken, OutputSink, SolverCommand, SolverProcess, SupervisorError, Termination},
};
use chrono::{DateTime, Local, Utc};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use reqwest::blocking::Client;
use solverbot_data::{Catalog, Job, ResultMessage, ScoreSummary};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use window::{FailureWindow, WindowReport};

pub const STOP_FILE: &str = "stop";
pub const RESTART_FILE: &str = "restart";
pub const STATLOG_FILE: &str = "statlog";
pub const SOLUTION_FILE: &str = "bestKmpp.dsz";
pub const BINLOG_FILE: &str = "binlog";

const WORKDIR_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{path}: could not create run dir: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub threads: usize,
    pub timeout: Duration,
    pub solver: PathBuf,
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
    /// polled for stop files next to the work dir
    pub client_dir: PathBuf,
    pub full_priority: bool,
    /// pause after each launch
    pub launch_spacing: Duration,
    /// wait after a failed launch, or when there is nothing to run
    pub retry_wait: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            threads: config.threads(),
            timeout: config.timeout(),
            solver: config.solver_path(),
            data_dir: config.data_dir(),
            work_dir: config.work_dir(),
            client_dir: config.client_dir.clone(),
            full_priority: config.full_priority,
            launch_spacing: Duration::from_secs(1),
            retry_wait: Duration::from_secs(60),
        }
    }
}

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Stopped,
    /// the caller should replace the process with a fresh copy of itself
    Restart,
}

/// One supervised solver execution
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRun {
    id: u64,
    pub job: Job,
    pub workdir: PathBuf,
    pub started: DateTime<Utc>,
    pub pid: u32,
}

impl From<&ActiveRun> for RunningRecord {
    fn from(run: &ActiveRun) -> Self {
        Self {
            cwd: run.workdir.clone(),
            s: run.started.to_rfc3339(),
            sn: run.started.timestamp(),
            cfg: run.job.clone(),
        }
    }
}

#[derive(Debug)]
struct SchedulerState {
    active: Vec<ActiveRun>,
    window: FailureWindow,
    restart: bool,
    next_id: u64,
}

/// Bounded pool of solver runs fed by weighted random job picks
///
/// All shared state sits behind one lock paired with one condition variable, completions
/// and shutdown requests broadcast on it.
pub struct Scheduler {
    settings: SchedulerSettings,
    catalog: Catalog,
    jobs: JobSet,
    ledger: Arc<Ledger>,
    client: Client,
    submitter: Submitter,
    /// held from the sent check until the sent mark, so equal results are posted once
    submitting: Mutex<()>,
    sink: OutputSink,
    cancel: CancelToken,
    graceful_exit: AtomicBool,
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        catalog: Catalog,
        jobs: JobSet,
        ledger: Arc<Ledger>,
        client: Client,
        sink: OutputSink,
    ) -> Arc<Self> {
        let window = FailureWindow::new(
            catalog.max_failures_numerator,
            catalog.max_failures_denominator,
        );
        let submitter = Submitter::new(client.clone(), catalog.post_url.clone());

        Arc::new(Self {
            settings,
            catalog,
            jobs,
            ledger,
            client,
            submitter,
            submitting: Mutex::new(()),
            sink,
            cancel: CancelToken::new(),
            graceful_exit: AtomicBool::new(false),
            state: Mutex::new(SchedulerState {
                active: Vec::new(),
                window,
                restart: false,
                next_id: 0,
            }),
            changed: Condvar::new(),
        })
    }

    /// let running solvers finish, start nothing new
    pub fn quit(&self) {
        self.graceful_exit.store(true, Ordering::SeqCst);
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// quit, then ask the caller to restart once everything drained
    pub fn restart(&self) {
        self.state.lock().restart = true;
        self.quit();
    }

    /// quit and kill every running solver
    pub fn abort(&self) {
        self.quit();
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.graceful_exit.load(Ordering::SeqCst)
    }

    pub fn active_runs(&self) -> Vec<ActiveRun> {
        self.state.lock().active.clone()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// schedule runs until stopped, then wait for every active run to finish
    #[instrument(skip(self), fields(threads = self.settings.threads), level = "info")]
    pub fn run(self: &Arc<Self>) -> Exit {
        info!(jobs = self.jobs.len(), weight = self.jobs.weight_sum(), "Starting run loop");
        let mut state = self.state.lock();

        while !self.is_stopping() {
            if let Some(restart) = self.poll_stop_files() {
                state.restart |= restart;
                self.graceful_exit.store(true, Ordering::SeqCst);
                break;
            }

            if state.active.len() >= self.settings.threads {
                self.changed.wait(&mut state);
                continue;
            }

            let Some(job) = self.jobs.pick_random(&mut rand::rng()).cloned() else {
                debug!("Nothing to schedule");
                self.changed.wait_for(&mut state, self.settings.retry_wait);
                continue;
            };

            let id = state.next_id;
            state.next_id += 1;

            match MutexGuard::unlocked(&mut state, || self.launch(id, &job)) {
                Ok((run, process)) => {
                    self.track(&mut state, run, process);
                    MutexGuard::unlocked(&mut state, || thread::sleep(self.settings.launch_spacing));
                }
                Err(error) => {
                    error!(error = ?error, job = %job.name, "Failed to start solver: {error}");
                    self.changed.wait_for(&mut state, self.settings.retry_wait);
                }
            }
        }

        info!(active = state.active.len(), "Draining");
        while !state.active.is_empty() {
            self.changed.wait(&mut state);
        }

        if state.restart {
            Exit::Restart
        } else {
            Exit::Stopped
        }
    }

    /// `Some(restart)` if a stop or restart file was found, the file is removed
    fn poll_stop_files(&self) -> Option<bool> {
        let dirs = [&self.settings.work_dir, &self.settings.client_dir];

        for (name, restart) in [(RESTART_FILE, true), (STOP_FILE, false)] {
            for dir in dirs {
                let path = dir.join(name);
                if !path.exists() {
                    continue;
                }

                info!(path = ?path, "Saw stop file, quitting");
                if let Err(error) = fs::remove_file(&path) {
                    warn!(error = ?error, path = ?path, "Failed to remove stop file: {error}");
                }
                return Some(restart);
            }
        }

        None
    }

    /// prepare and start one run, called without the lock
    fn launch(&self, id: u64, job: &Job) -> Result<(ActiveRun, SolverProcess), LaunchError> {
        ensure_dataset(&self.client, &self.catalog, job, &self.settings.data_dir)?;
        let workdir = create_workdir(&self.settings.work_dir, &job.name)?;

        let command = SolverCommand {
            bin: self.settings.solver.clone(),
            args: job_command_args(job, &self.settings.data_dir, self.settings.full_priority),
            cwd: workdir.clone(),
        };
        let process = SolverProcess::spawn(&command, self.sink.clone())?;
        info!(job = %job.name, pid = process.pid(), workdir = ?workdir, "Started run");

        Ok((
            ActiveRun {
                id,
                job: job.clone(),
                workdir,
                started: Utc::now(),
                pid: process.pid(),
            },
            process,
        ))
    }

    /// register a started run and hand it to its completion waiter
    fn track(self: &Arc<Self>, state: &mut SchedulerState, run: ActiveRun, process: SolverProcess) {
        let pid = run.pid;
        let scheduler = Arc::clone(self);
        let waiter_run = run.clone();
        state.active.push(run);

        let spawned = thread::Builder::new()
            .name(format!("waiter-{pid}"))
            .spawn(move || scheduler.complete(waiter_run, process));

        if let Err(error) = spawned {
            error!(error = ?error, pid, "Failed to start completion waiter, killing solver: {error}");
            // the dropped child is never reaped, so the group id is still ours
            if let Err(errno) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!(errno = ?errno, pid, "Failed to kill solver");
            }
            state.active.retain(|active| active.pid != pid);
            state.window.push(false.into());
        }
    }

    /// completion waiter: supervise, account, then release the slot
    fn complete(&self, run: ActiveRun, process: SolverProcess) {
        let termination = process.supervise(self.settings.timeout, &self.cancel);
        let finished = Utc::now();
        let success = self.account(&run, termination, finished);

        let mut state = self.state.lock();
        state.window.push(success.into());
        if state.window.alarm() {
            let report = state.window.report();
            error!(
                failures = report.failures,
                capacity = report.capacity,
                "Too many solver failures, {}/{}",
                report.failures,
                report.capacity
            );
        }
        state.active.retain(|active| active.id != run.id);
        self.changed.notify_all();
    }

    /// summarize, journal and maybe submit a finished run, returns whether it succeeded
    #[instrument(skip_all, fields(job = %run.job.name, pid = run.pid), level = "debug")]
    fn account(&self, run: &ActiveRun, termination: Termination, finished: DateTime<Utc>) -> bool {
        let mut ok = termination.success();
        if !ok {
            warn!(termination = ?termination, workdir = ?run.workdir, "Solver failed");
        }

        let statlog = run.workdir.join(STATLOG_FILE);
        let summary = match archive_and_summarize(&statlog) {
            Ok(summary) => Some(summary),
            Err(StatlogError::NotFound { tail }) => {
                if ok {
                    warn!(path = ?statlog, "No best score in statlog, last lines:\n{tail}");
                }
                ok = false;
                None
            }
            Err(error @ StatlogError::Malformed { .. }) => {
                error!(error = ?error, path = ?statlog, "Unexpected solver output: {error}");
                ok = false;
                None
            }
            Err(error) => {
                error!(error = ?error, path = ?statlog, "Failed to process statlog: {error}");
                ok = false;
                None
            }
        };

        let score = summary
            .as_ref()
            .map(|summary| summary.score)
            .unwrap_or_default();
        let record = FinishRecord::new(&run.job.name, run.started, finished, &run.workdir, score, ok);
        match self.ledger.record_finish(record) {
            Ok(true) => info!(kmpp = score.kmpp, "New local best"),
            Ok(false) => {}
            Err(error) => error!(error = ?error, "Failed to journal run: {error}"),
        }

        if let Some(summary) = summary.filter(|_| ok) {
            self.maybe_submit(run, &summary, finished);
        }
        debug!(ok, kmpp = score.kmpp, "Run finished");

        ok
    }

    fn maybe_submit(&self, run: &ActiveRun, summary: &Summary, finished: DateTime<Utc>) {
        let job = &run.job;
        let _submitting = self.submitting.lock();

        if !job.send_anything && !summary.score.is_qualifying() {
            debug!(kmpp = summary.score.kmpp, "Trivial score, not sending");
            return;
        }
        if let Some(sent) = self.ledger.sent(&job.name) {
            if !summary.score.beats(&sent) {
                debug!(kmpp = summary.score.kmpp, sent = sent.kmpp, "Not better than what was sent");
                return;
            }
        }
        if !job.send_anything && job.too_weak(&summary.score) {
            debug!(kmpp = summary.score.kmpp, spread = summary.score.spread, "Above send thresholds");
            return;
        }

        let Some(result) = build_result(run, summary, finished) else {
            return;
        };

        match self.submitter.submit(&result) {
            Ok(()) => {
                info!(kmpp = summary.score.kmpp, url = self.submitter.url(), "Sent result");
                if let Err(error) = self.ledger.mark_sent(&job.name, summary.score) {
                    error!(error = ?error, "Failed to remember sent result: {error}");
                }
            }
            Err(error) => error!(error = ?error, "Failed to send result: {error}"),
        }
    }
}

/// the submission payload for a run, `None` when there is nothing worth sending
fn build_result(run: &ActiveRun, summary: &Summary, finished: DateTime<Utc>) -> Option<ResultMessage> {
    let job = &run.job;
    let mut result = ResultMessage {
        job: job.name.clone(),
        started: run.started.timestamp_millis(),
        finished: finished.timestamp_millis(),
        seconds: (finished - run.started).num_milliseconds() as f64 / 1000.0,
        score: summary.score,
        ok: true,
        statsum: summary.statsum.clone(),
        ..Default::default()
    };

    let solution_path = run.workdir.join(SOLUTION_FILE);
    match fs::read(&solution_path) {
        Ok(solution) => result.set_solution(&solution),
        Err(error) => {
            warn!(error = ?error, path = ?solution_path, "No solution: {error}");
            if !job.send_anything {
                return None;
            }
        }
    }

    if job.send_anything {
        let binlog_path = run.workdir.join(BINLOG_FILE);
        match fs::read(&binlog_path) {
            Ok(binlog) => result.set_binlog(&binlog),
            Err(error) => {
                warn!(error = ?error, path = ?binlog_path, "No binlog: {error}");
                if result.solution_b64.is_empty() {
                    return None;
                }
            }
        }
    }

    Some(result)
}

/// `<work>/<job>/<YYYYmmdd_HHMMSS>_<NNNN>`, never reusing an existing directory
fn create_workdir(work_dir: &Path, job: &str) -> Result<PathBuf, LaunchError> {
    let parent = work_dir.join(job);
    fs::create_dir_all(&parent).map_err(|source| LaunchError::Workdir {
        path: parent.clone(),
        source,
    })?;

    let mut rng = rand::rng();
    let mut last_error = io::Error::from(io::ErrorKind::AlreadyExists);
    for _ in 0..WORKDIR_ATTEMPTS {
        let name = format!(
            "{}_{:04}",
            Local::now().format("%Y%m%d_%H%M%S"),
            rng.random_range(0..10_000)
        );
        let path = parent.join(name);

        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => last_error = error,
            Err(source) => return Err(LaunchError::Workdir { path, source }),
        }
    }

    Err(LaunchError::Workdir {
        path: parent,
        source: last_error,
    })
}

impl StatusSource for Scheduler {
    fn best(&self) -> BTreeMap<String, ScoreSummary> {
        self.ledger.list()
    }

    fn best_full(&self) -> BTreeMap<String, FinishRecord> {
        self.ledger.list_full()
    }

    fn running(&self) -> Vec<RunningRecord> {
        self.state.lock().active.iter().map(RunningRecord::from).collect()
    }

    fn failures(&self) -> WindowReport {
        self.state.lock().window.report()
    }
}
