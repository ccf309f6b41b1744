use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// how long the waiter blocks before it re-checks the deadline and the cancel token
pub const WATCH_SLICE: Duration = Duration::from_millis(250);

/// Shared destination of all solver output lines
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn stdout_sink() -> OutputSink {
    Arc::new(Mutex::new(Box::new(io::stdout())))
}

/// Cooperative kill switch shared by every supervised process
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{bin}: failed to start solver: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start output forwarder for pid {pid}: {source}")]
    Forwarder {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    /// killed by the watchdog
    TimedOut,
    /// killed through the cancel token
    Cancelled,
    WaitFailed,
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(status) if status.success())
    }
}

/// Everything needed to start one solver run
#[derive(Debug, Clone, PartialEq)]
pub struct SolverCommand {
    pub bin: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// One running solver, its output forwarders and nothing else
#[derive(Debug)]
pub struct SolverProcess {
    child: Child,
    pid: u32,
    forwarders: Vec<JoinHandle<()>>,
}

impl SolverProcess {
    /// start the solver in its own process group with stdin closed
    pub fn spawn(command: &SolverCommand, sink: OutputSink) -> Result<Self, SupervisorError> {
        let mut child = Command::new(&command.bin)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                bin: command.bin.clone(),
                source,
            })?;
        let pid = child.id();

        let streams = [
            child.stdout.take().map(|out| ('O', Box::new(out) as Box<dyn Read + Send>)),
            child.stderr.take().map(|err| ('E', Box::new(err) as Box<dyn Read + Send>)),
        ];

        let mut forwarders = Vec::with_capacity(2);
        for (tag, stream) in streams.into_iter().flatten() {
            let sink = sink.clone();
            let spawned = thread::Builder::new()
                .name(format!("solver-{pid}-{tag}"))
                .spawn(move || forward(stream, tag, pid, sink));

            match spawned {
                Ok(handle) => forwarders.push(handle),
                Err(source) => {
                    if let Err(error) = child.kill().and_then(|_| child.wait()) {
                        warn!(error = ?error, pid, "Failed to reap solver after forwarder failure: {error}");
                    }
                    return Err(SupervisorError::Forwarder { pid, source });
                }
            }
        }

        debug!(pid, bin = ?command.bin, cwd = ?command.cwd, "Started solver");

        Ok(Self {
            child,
            pid,
            forwarders,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// wait for the process to exit, killing it once `timeout` passed or `cancel` fired
    ///
    /// Output forwarders are joined before returning, so every line reached the sink.
    #[instrument(skip(self, cancel), fields(pid = self.pid), level = "debug")]
    pub fn supervise(mut self, timeout: Duration, cancel: &CancelToken) -> Termination {
        let deadline = Instant::now() + timeout;

        let termination = loop {
            if cancel.is_cancelled() {
                break self.kill(Termination::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                break self.kill(Termination::TimedOut);
            }

            match self.child.wait_timeout((deadline - now).min(WATCH_SLICE)) {
                Ok(Some(status)) => break Termination::Exited(status),
                Ok(None) => continue,
                Err(error) => {
                    error!(error = ?error, "Failed to wait for solver: {error}");
                    self.kill(Termination::WaitFailed);
                    break Termination::WaitFailed;
                }
            }
        };

        if let Termination::Exited(_) = termination {
            self.kill_leftovers();
        }

        for handle in self.forwarders.drain(..) {
            if handle.join().is_err() {
                warn!("Output forwarder panicked");
            }
        }

        termination
    }

    /// kill whatever the exited solver left in its group, they would hold the output pipes open
    fn kill_leftovers(&self) {
        // a group with live members keeps its id, an empty one answers ESRCH
        match killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid = self.pid, "Killed processes left behind by solver"),
            Err(Errno::ESRCH) => {}
            Err(errno) => warn!(errno = ?errno, pid = self.pid, "Failed to kill solver leftovers"),
        }
    }

    /// kill the whole process group, then reap the child
    fn kill(&mut self, reason: Termination) -> Termination {
        warn!(pid = self.pid, reason = ?reason, "Killing solver");

        // the child is not reaped yet, so its group id cannot have been reused
        if let Err(errno) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            debug!(errno = ?errno, "killpg failed, killing the child only");
            if let Err(error) = self.child.kill() {
                warn!(error = ?error, "Failed to kill solver: {error}");
            }
        }

        match self.child.wait() {
            Ok(_) => reason,
            Err(error) => {
                error!(error = ?error, "Failed to reap killed solver: {error}");
                Termination::WaitFailed
            }
        }
    }
}

/// copy `stream` line by line into the sink as `<tag> <pid> <line>`
fn forward(stream: Box<dyn Read + Send>, tag: char, pid: u32, sink: OutputSink) {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    let mut sink_failed = false;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                warn!(error = ?error, pid, "Failed to read solver output: {error}");
                break;
            }
        }

        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if sink_failed {
            // keep draining so the solver never blocks on a full pipe
            continue;
        }

        let line = String::from_utf8_lossy(&raw);
        let mut out = sink.lock();
        if let Err(error) = writeln!(out, "{tag} {pid} {line}").and_then(|_| out.flush()) {
            warn!(error = ?error, pid, "Failed to write solver output: {error}");
            sink_failed = true;
        }
    }
}
