//! External transfer worker process.
//!
//! Stdout is drained by a background task into a channel so that [`poll`]
//! never blocks: it takes whatever output has arrived, then checks for exit.
//!
//! [`poll`]: TransferWorker::poll

use std::ffi::OsStr;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::HandoffError;

/// Bytes read from the worker per read call.
const READ_CHUNK: usize = 100 * 1024;

/// How long a terminated worker gets to exit before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for trailing output after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoll {
    Running,
    Exited(i32),
}

/// A running transfer worker.
pub struct TransferWorker {
    program: PathBuf,
    child: Child,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    /// Keep stdout for the caller instead of only logging it.
    capture: bool,
    captured: Vec<u8>,
    last_output: Instant,
}

impl TransferWorker {
    /// Start `program` with `args`.
    pub fn spawn<I, S>(program: &Path, args: I, capture: bool) -> Result<Self, HandoffError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HandoffError::Launch {
                path: program.to_path_buf(),
                source,
            })?;

        debug!(program = %program.display(), pid = ?child.id(), "Started transfer worker");

        let (tx, output) = mpsc::unbounded_channel();
        let reader = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read transfer worker output");
                            break;
                        }
                    }
                }
            })
        });

        Ok(Self {
            program: program.to_path_buf(),
            child,
            output,
            reader,
            capture,
            captured: Vec::new(),
            last_output: Instant::now(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take available output and check whether the worker has exited.
    pub fn poll(&mut self) -> Result<WorkerPoll, HandoffError> {
        self.drain();
        match self.child.try_wait()? {
            Some(status) => Ok(WorkerPoll::Exited(exit_code(status))),
            None => Ok(WorkerPoll::Running),
        }
    }

    /// Time since the worker last wrote to stdout (or since start).
    pub fn idle_for(&self) -> Duration {
        self.last_output.elapsed()
    }

    fn drain(&mut self) {
        while let Ok(chunk) = self.output.try_recv() {
            self.record(chunk);
        }
    }

    fn record(&mut self, chunk: Vec<u8>) {
        self.last_output = Instant::now();
        debug!(
            program = %self.program.display(),
            output = %String::from_utf8_lossy(&chunk).trim_end(),
            "Transfer worker output"
        );
        if self.capture {
            self.captured.extend_from_slice(&chunk);
        }
    }

    /// Collect the remaining output of an exited worker.
    pub async fn finish(mut self) -> Vec<u8> {
        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(program = %self.program.display(), "Transfer worker output still open after exit");
            }
        }
        self.drain();
        std::mem::take(&mut self.captured)
    }

    /// Stop the worker: SIGTERM, then SIGKILL after a grace period.
    pub async fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to signal transfer worker");
            }
        }

        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(program = %self.program.display(), code = exit_code(status), "Transfer worker stopped");
            }
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for transfer worker"),
            Err(_) => {
                warn!(program = %self.program.display(), "Transfer worker ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill transfer worker");
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Exit code, or 128 + signal number for a signalled worker.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
