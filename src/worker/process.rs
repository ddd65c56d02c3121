//! Capture worker in a child process.
//!
//! The parent owns the child's stdin and stdout. Events arrive on stdout as
//! [`wire`](super::wire) messages; closing stdin asks the child to stop.
//! Logs from the child go to the inherited stderr.

use super::pipeline::{self, PipeSink, PipelineExit};
use super::{wire, CaptureWorker, Dispatch, StopSignal, WorkerError};
use crate::config::{RestartPolicy, WorkerSettings};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::ffi::OsString;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a child may linger after closing stdout before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);
const REAP_POLL: Duration = Duration::from_millis(20);

/// How to launch the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// This executable's `capture-worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("capture-worker"))
    }

    fn spawn(&self, settings: &str) -> io::Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--settings")
            .arg(settings)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // Keep terminal signals away from the child; the parent decides when it stops.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command.spawn()
    }
}

/// A supervised child process running the capture pipeline.
///
/// A child that exits on its own is restarted with backoff until the
/// restart budget runs out.
pub struct ProcessWorker {
    stop: StopSignal,
    child: Arc<Mutex<Option<Child>>>,
    pid: Arc<AtomicU32>,
    done: Receiver<()>,
    supervisor: Option<JoinHandle<()>>,
}

impl ProcessWorker {
    /// Starts the first child and the thread that supervises it.
    pub fn spawn(
        command: WorkerCommand,
        settings: &WorkerSettings,
        dispatch: Dispatch,
        restart: RestartPolicy,
    ) -> Result<Self, WorkerError> {
        let settings = settings.to_toml()?;
        let stop = StopSignal::new();
        let child = Arc::new(Mutex::new(None));
        let pid = Arc::new(AtomicU32::new(0));
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);

        let supervisor = {
            let stop = stop.clone();
            let child = Arc::clone(&child);
            let pid = Arc::clone(&pid);
            thread::Builder::new()
                .name("worker-supervisor".into())
                .spawn(move || {
                    let _done = done_tx;
                    supervise(&command, &settings, &dispatch, &restart, &stop, &child, &pid);
                })?
        };

        Ok(Self {
            stop,
            child,
            pid,
            done,
            supervisor: Some(supervisor),
        })
    }

    /// Process id of the current child, if one is running.
    pub fn child_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

impl CaptureWorker for ProcessWorker {
    fn shutdown(mut self: Box<Self>, timeout: Duration) -> Result<(), WorkerError> {
        self.stop.trigger();
        if let Some(child) = lock(&self.child).as_mut() {
            drop(child.stdin.take());
        }

        let half = timeout / 2;
        if !self.wait_done(half) {
            tracing::warn!(pid = ?self.child_id(), "capture worker ignored stop request, killing");
            if let Some(child) = lock(&self.child).as_mut() {
                if let Err(e) = child.kill() {
                    tracing::warn!(error = %e, "failed to kill capture worker");
                }
            }
            if !self.wait_done(timeout.saturating_sub(half)) {
                tracing::error!(?timeout, "capture worker unresponsive");
                return Err(WorkerError::Unresponsive(timeout));
            }
        }

        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                tracing::error!("worker supervisor panicked");
            }
        }
        tracing::info!("capture worker stopped");
        Ok(())
    }

    fn describe(&self) -> String {
        match self.child_id() {
            Some(pid) => format!("capture process (pid {pid})"),
            None => "capture process (not running)".to_string(),
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.stop.trigger();
            if let Some(child) = lock(&self.child).as_mut() {
                drop(child.stdin.take());
            }
        }
    }
}

fn supervise(
    command: &WorkerCommand,
    settings: &str,
    dispatch: &Dispatch,
    restart: &RestartPolicy,
    stop: &StopSignal,
    slot: &Mutex<Option<Child>>,
    pid: &AtomicU32,
) {
    let mut restarts = 0u32;
    loop {
        let spawned = {
            let mut guard = lock(slot);
            if stop.is_triggered() {
                break;
            }
            command.spawn(settings).map(|mut child| {
                let stdout = child.stdout.take();
                let id = child.id();
                *guard = Some(child);
                (id, stdout)
            })
        };

        match spawned {
            Ok((id, stdout)) => {
                let started = Instant::now();
                pid.store(id, Ordering::Release);
                tracing::info!(pid = id, "capture worker started");
                dispatch.set_running(true);

                let clean = stdout.map_or(true, |stdout| pump(stdout, dispatch));
                if !clean {
                    kill(slot);
                }
                let status = reap(slot);

                pid.store(0, Ordering::Release);
                dispatch.set_running(false);
                if stop.is_triggered() {
                    tracing::info!(pid = id, ?status, "capture worker exited");
                    break;
                }
                tracing::warn!(pid = id, ?status, "capture worker exited unexpectedly");
                if started.elapsed() > Duration::from_millis(restart.max_delay_ms) {
                    restarts = 0;
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn capture worker"),
        }

        restarts += 1;
        if restart.max_restarts.is_some_and(|max| restarts > max) {
            tracing::error!(restarts = restarts - 1, "capture worker restart budget exhausted");
            break;
        }
        let delay = restart.delay_for(restarts);
        dispatch.metrics().record_restart();
        tracing::warn!(restart = restarts, ?delay, "restarting capture worker");
        if !matches!(stop.receiver().recv_timeout(delay), Err(RecvTimeoutError::Timeout)) {
            break;
        }
    }
}

/// Forwards events until the child closes stdout. Returns false if the
/// stream was corrupt.
fn pump(stdout: ChildStdout, dispatch: &Dispatch) -> bool {
    let mut reader = BufReader::with_capacity(256 * 1024, stdout);
    loop {
        match wire::read_event(&mut reader) {
            Ok(Some(event)) => {
                dispatch.dispatch(event);
            }
            Ok(None) => return true,
            Err(e) => {
                tracing::error!(error = %e, "corrupt capture worker stream");
                return false;
            }
        }
    }
}

fn kill(slot: &Mutex<Option<Child>>) {
    if let Some(child) = lock(slot).as_mut() {
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "kill failed");
        }
    }
}

/// Waits for the child in `slot` to exit, killing it after [`EXIT_GRACE`].
///
/// The child stays in the slot while waiting so that shutdown can still
/// reach it.
fn reap(slot: &Mutex<Option<Child>>) -> Option<ExitStatus> {
    let deadline = Instant::now() + EXIT_GRACE;
    let mut killed = false;
    loop {
        {
            let mut guard = lock(slot);
            let child = guard.as_mut()?;
            match child.try_wait() {
                Ok(Some(status)) => {
                    guard.take();
                    return Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait on capture worker");
                    guard.take();
                    return None;
                }
            }
            if !killed && Instant::now() >= deadline {
                tracing::warn!("capture worker closed its output but kept running, killing");
                let _ = child.kill();
                killed = true;
            }
        }
        thread::sleep(REAP_POLL);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry point of the worker process.
///
/// Runs the pipeline with events on stdout until stdin closes, a
/// termination signal arrives, or the parent stops reading.
pub fn run_child(settings: &WorkerSettings) -> PipelineExit {
    let stop = StopSignal::new();

    let watcher = {
        let stop = stop.clone();
        thread::Builder::new().name("stdin-watch".into()).spawn(move || {
            let _ = io::copy(&mut io::stdin(), &mut io::sink());
            tracing::debug!("stdin closed");
            stop.trigger();
        })
    };
    if let Err(e) = watcher {
        tracing::warn!(error = %e, "no stdin watcher, relying on signals");
    }

    let on_signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.trigger()) {
        tracing::warn!(error = %e, "failed to install signal handler");
    }

    let events = PipeSink::new(BufWriter::with_capacity(256 * 1024, io::stdout()));
    pipeline::run_from_settings(settings, Box::new(events), &stop)
}
