//! Send and receive state machines.
//!
//! `Idle -> Preloading -> Transferring -> Completed`, or `Failed` from any
//! step. Scratch files live in a private `cloudlet-residue-*` directory that
//! is removed when the operation's guard drops, whatever the outcome.

use std::path::{Path, PathBuf};

use cloudlet_id::{BaseHash, HandoffId};
use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::output::{HandoffLaunch, WorkerStatusLine};
use super::preload::preload_hash_index;
use super::request::{
    write_request, HandoffRecvRequest, HandoffSendRequest, LiveSessionState, TransferOptions,
};
use super::url::HandoffDestination;
use super::worker::{TransferWorker, WorkerPoll};
use super::{HandoffConfig, HandoffError, HandoffState};
use crate::image::BaseImagePaths;
use crate::poll::{repeat_until, Repeat};

const SCRATCH_PREFIX: &str = "cloudlet-residue-";
const SEND_REQUEST_FILE: &str = "handoff_data";
const RECV_REQUEST_FILE: &str = "handoff-data";
const RESIDUE_FILE: &str = "overlay.zip";

/// Inputs of a send.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub handoff_id: HandoffId,
    pub base_paths: BaseImagePaths,
    pub base_hash: BaseHash,
    pub session: LiveSessionState,
    pub options: TransferOptions,
    /// `file://` or `tcp://`; `http://` destinations must be negotiated first.
    pub destination: HandoffDestination,
}

/// Inputs of a receive.
#[derive(Debug, Clone)]
pub struct RecvJob {
    pub handoff_id: HandoffId,
    pub base_paths: BaseImagePaths,
    pub base_hash: BaseHash,
}

/// Residue archive left by a `file://` send. Deleted on drop.
#[derive(Debug)]
pub struct ResidueFile {
    path: PathBuf,
    _scratch: TempDir,
}

impl ResidueFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of a completed send.
#[derive(Debug)]
pub struct SendOutcome {
    pub handoff_id: HandoffId,
    pub residue: Option<ResidueFile>,
}

/// Result of a completed receive. Launch artifacts are deleted on drop.
#[derive(Debug)]
pub struct ReceivedHandoff {
    pub launch: HandoffLaunch,
    _scratch: TempDir,
}

/// Drives one handoff through the transfer worker.
pub struct HandoffEngine {
    config: HandoffConfig,
    state: watch::Sender<HandoffState>,
}

impl HandoffEngine {
    pub fn new(config: HandoffConfig) -> Self {
        let (state, _) = watch::channel(HandoffState::Idle);
        Self { config, state }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<HandoffState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> HandoffState {
        self.state.borrow().clone()
    }

    fn transition(&self, next: HandoffState) {
        debug!(state = ?next, "Handoff state transition");
        self.state.send_replace(next);
    }

    fn conclude<T>(&self, result: Result<T, HandoffError>) -> Result<T, HandoffError> {
        match &result {
            Ok(_) => self.transition(HandoffState::Completed),
            Err(e) => self.transition(HandoffState::Failed(e.to_string())),
        }
        result
    }

    fn scratch_dir(&self) -> Result<TempDir, HandoffError> {
        std::fs::create_dir_all(&self.config.work_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.config.work_dir)?)
    }

    /// Transfer a live VM to `job.destination`.
    pub async fn send(
        &self,
        job: SendJob,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SendOutcome, HandoffError> {
        let handoff_id = job.handoff_id;
        info!(handoff_id = %handoff_id, destination = %job.destination, "Starting handoff send");
        let result = self.run_send(job, cancel).await;
        if let Err(e) = &result {
            warn!(handoff_id = %handoff_id, error = %e, "Handoff send failed");
        }
        self.conclude(result)
    }

    async fn run_send(
        &self,
        job: SendJob,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SendOutcome, HandoffError> {
        self.transition(HandoffState::Preloading);
        let (disk_hash_dict, memory_hash_dict) = tokio::try_join!(
            preload_hash_index(&job.base_paths.disk_hash_index),
            preload_hash_index(&job.base_paths.memory_hash_index),
        )?;
        debug!(
            handoff_id = %job.handoff_id,
            disk_chunks = disk_hash_dict.len(),
            memory_chunks = memory_hash_dict.len(),
            "Preloaded base hash indexes"
        );

        let scratch = self.scratch_dir()?;
        let (destination, residue_path) = match &job.destination {
            HandoffDestination::File(_) => {
                let path = std::path::absolute(scratch.path().join(RESIDUE_FILE))?;
                (format!("file://{}", path.display()), Some(path))
            }
            HandoffDestination::Tcp { .. } => (job.destination.to_string(), None),
            HandoffDestination::Http(url) => {
                return Err(HandoffError::InvalidDestination(format!(
                    "{url} must be negotiated before sending"
                )))
            }
        };

        let request = HandoffSendRequest {
            handoff_id: job.handoff_id,
            base_paths: job.base_paths,
            base_hash: job.base_hash,
            disk_hash_dict,
            memory_hash_dict,
            options: job.options,
            destination,
            transfer_mode: None,
            session: job.session,
        };
        let request_path = scratch.path().join(SEND_REQUEST_FILE);
        write_request(&request_path, &request).await?;

        self.transition(HandoffState::Transferring);
        let mut worker = TransferWorker::spawn(&self.config.send_worker, [&request_path], false)?;
        let code = self.monitor(&mut worker, cancel).await?;
        worker.finish().await;

        if code != 0 {
            return Err(HandoffError::WorkerExit { code });
        }

        let residue = match residue_path {
            Some(path) => {
                if !tokio::fs::try_exists(&path).await? {
                    return Err(HandoffError::MalformedOutput(format!(
                        "worker produced no residue at {}",
                        path.display()
                    )));
                }
                Some(ResidueFile {
                    path,
                    _scratch: scratch,
                })
            }
            None => None,
        };

        info!(handoff_id = %request.handoff_id, "Handoff send finished");
        Ok(SendOutcome {
            handoff_id: request.handoff_id,
            residue,
        })
    }

    /// Receive a VM and produce its launch artifacts.
    pub async fn receive(
        &self,
        job: RecvJob,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ReceivedHandoff, HandoffError> {
        let handoff_id = job.handoff_id;
        info!(handoff_id = %handoff_id, "Starting handoff receive");
        let result = self.run_receive(job, cancel).await;
        if let Err(e) = &result {
            warn!(handoff_id = %handoff_id, error = %e, "Handoff receive failed");
        }
        self.conclude(result)
    }

    async fn run_receive(
        &self,
        job: RecvJob,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ReceivedHandoff, HandoffError> {
        let scratch = self.scratch_dir()?;
        let launch_disk = scratch.path().join(format!("{}-launch-disk", job.handoff_id));
        let launch_memory = scratch
            .path()
            .join(format!("{}-launch-memory", job.handoff_id));

        let request = HandoffRecvRequest {
            handoff_id: job.handoff_id,
            base_paths: job.base_paths,
            base_hash: job.base_hash,
            launch_disk_path: launch_disk.clone(),
            launch_memory_path: launch_memory.clone(),
        };
        let request_path = scratch.path().join(RECV_REQUEST_FILE);
        write_request(&request_path, &request).await?;

        self.transition(HandoffState::Transferring);
        let mut worker = TransferWorker::spawn(
            &self.config.recv_worker,
            [Path::new("-d"), request_path.as_path()],
            true,
        )?;
        let code = self.monitor(&mut worker, cancel).await?;
        let stdout = worker.finish().await;

        if code != 0 {
            return Err(HandoffError::WorkerExit { code });
        }

        let status = WorkerStatusLine::parse(&String::from_utf8_lossy(&stdout))?;
        info!(
            handoff_id = %request.handoff_id,
            disk_size = status.disk_size,
            memory_size = status.memory_size,
            "Handoff receive finished"
        );

        Ok(ReceivedHandoff {
            launch: HandoffLaunch::new(status, launch_disk, launch_memory),
            _scratch: scratch,
        })
    }

    /// Poll the worker until it exits. Stalls and cancellation stop it.
    async fn monitor(
        &self,
        worker: &mut TransferWorker,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<i32, HandoffError> {
        let max_stall = self.config.max_stall;
        let outcome = repeat_until(self.config.poll_interval, cancel, || match worker.poll()? {
            WorkerPoll::Exited(code) => Ok(Some(code)),
            WorkerPoll::Running if worker.idle_for() > max_stall => Err(HandoffError::Stalled {
                secs: max_stall.as_secs(),
            }),
            WorkerPoll::Running => Ok(None),
        })
        .await;

        match outcome {
            Ok(Repeat::Done(code)) => {
                debug!(code, "Transfer worker exited");
                Ok(code)
            }
            Ok(Repeat::Cancelled) => {
                worker.terminate().await;
                Err(HandoffError::Cancelled)
            }
            Err(e) => {
                worker.terminate().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DomainHandle, OverlayTracker};
    use cloudlet_id::VmId;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    struct Fixture {
        dir: TempDir,
        paths: BaseImagePaths,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let base = dir.path().join("base");
            std::fs::create_dir_all(&base).unwrap();
            let paths = BaseImagePaths::in_dir(&base, "b");
            for kind in crate::image::ArtifactKind::ALL {
                std::fs::write(paths.get(kind), b"").unwrap();
            }
            Self { dir, paths }
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn engine(&self, send: &str, recv: &str) -> HandoffEngine {
            HandoffEngine::new(HandoffConfig {
                send_worker: self.script("send.sh", send),
                recv_worker: self.script("recv.sh", recv),
                work_dir: self.dir.path().join("work"),
                poll_interval: Duration::from_millis(10),
                max_stall: Duration::from_secs(30),
            })
        }

        fn send_job(&self, destination: &str) -> SendJob {
            SendJob {
                handoff_id: HandoffId::new(),
                base_paths: self.paths.clone(),
                base_hash: BaseHash::for_instance(&VmId::new()),
                session: LiveSessionState::capture(
                    &DomainHandle {
                        id: 3,
                        name: "instance-3".to_string(),
                    },
                    &OverlayTracker::default(),
                    "qemu:///system".to_string(),
                ),
                options: TransferOptions::default(),
                destination: HandoffDestination::parse(destination).unwrap(),
            }
        }

        fn recv_job(&self) -> RecvJob {
            RecvJob {
                handoff_id: HandoffId::new(),
                base_paths: self.paths.clone(),
                base_hash: BaseHash::for_instance(&VmId::new()),
            }
        }

        fn scratch_dirs(&self) -> usize {
            match std::fs::read_dir(self.dir.path().join("work")) {
                Ok(entries) => entries.count(),
                Err(_) => 0,
            }
        }
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_send_tcp_success() {
        let fx = Fixture::new();
        // The worker sees the request file and reports the destination it was given.
        let engine = fx.engine(r#"grep -q '"destination":"tcp://10.1.1.1:8022"' "$1""#, "exit 1");
        let (_tx, mut cancel) = no_cancel();

        let outcome = engine.send(fx.send_job("tcp://10.1.1.1:8022"), &mut cancel).await.unwrap();
        assert!(outcome.residue.is_none());
        assert_eq!(engine.state(), HandoffState::Completed);
        assert_eq!(fx.scratch_dirs(), 0);
    }

    #[tokio::test]
    async fn test_send_file_produces_residue() {
        let fx = Fixture::new();
        let engine = fx.engine(
            r#"dest=$(sed -n 's/.*"destination":"file:\/\/\([^"]*\)".*/\1/p' "$1"); echo residue > "$dest""#,
            "exit 1",
        );
        let (_tx, mut cancel) = no_cancel();

        let outcome = engine.send(fx.send_job("file://res"), &mut cancel).await.unwrap();
        let residue = outcome.residue.unwrap();
        assert_eq!(std::fs::read_to_string(residue.path()).unwrap(), "residue\n");
        assert_eq!(fx.scratch_dirs(), 1);

        drop(residue);
        assert_eq!(fx.scratch_dirs(), 0);
    }

    #[tokio::test]
    async fn test_send_worker_failure() {
        let fx = Fixture::new();
        let engine = fx.engine("exit 7", "exit 1");
        let (_tx, mut cancel) = no_cancel();

        let err = engine.send(fx.send_job("tcp://h:1"), &mut cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::WorkerExit { code: 7 }));
        assert!(matches!(engine.state(), HandoffState::Failed(_)));
        assert_eq!(fx.scratch_dirs(), 0);
    }

    #[tokio::test]
    async fn test_send_preload_failure_never_launches() {
        let fx = Fixture::new();
        std::fs::write(&fx.paths.disk_hash_index, vec![0u8; 47]).unwrap();
        let marker = fx.dir.path().join("launched");
        let engine = fx.engine(&format!("touch {}", marker.display()), "exit 1");
        let (_tx, mut cancel) = no_cancel();

        let err = engine.send(fx.send_job("tcp://h:1"), &mut cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::Preload { .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_send_cancelled() {
        let fx = Fixture::new();
        let engine = fx.engine("sleep 30", "exit 1");
        let (tx, mut cancel) = no_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let err = engine.send(fx.send_job("tcp://h:1"), &mut cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::Cancelled));
        assert_eq!(fx.scratch_dirs(), 0);
    }

    #[tokio::test]
    async fn test_send_stalled() {
        let fx = Fixture::new();
        let mut engine = fx.engine("sleep 30", "exit 1");
        engine.config.max_stall = Duration::from_millis(100);
        let (_tx, mut cancel) = no_cancel();

        let err = engine.send(fx.send_job("tcp://h:1"), &mut cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::Stalled { .. }));
    }

    #[tokio::test]
    async fn test_receive_parses_status() {
        let fx = Fixture::new();
        let engine = fx.engine(
            "exit 1",
            r#"[ "$1" = "-d" ] || exit 2
echo "receiving"
printf 'OPENSTACK\t10737418240\t1073741824\t{}\t{}\n'"#,
        );
        let (_tx, mut cancel) = no_cancel();

        let received = engine.receive(fx.recv_job(), &mut cancel).await.unwrap();
        assert_eq!(received.launch.disk_size, 10737418240);
        assert_eq!(received.launch.memory_size, 1073741824);
        assert!(received
            .launch
            .launch_disk
            .to_string_lossy()
            .ends_with("-launch-disk"));
        assert_eq!(engine.state(), HandoffState::Completed);
    }

    #[tokio::test]
    async fn test_receive_bad_keyword() {
        let fx = Fixture::new();
        let engine = fx.engine("exit 1", r#"printf 'BADKEY\t1\t1\t{}\t{}\n'"#);
        let (_tx, mut cancel) = no_cancel();

        let err = engine.receive(fx.recv_job(), &mut cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::MalformedOutput(_)));
        assert_eq!(fx.scratch_dirs(), 0);
    }

    #[tokio::test]
    async fn test_receive_nonzero_exit() {
        let fx = Fixture::new();
        let engine = fx.engine("exit 1", r#"printf 'openstack\t1\t1\t{}\t{}\n'; exit 4"#);
        let (_tx, mut cancel) = no_cancel();

        let err = engine.receive(fx.recv_job(), &mut cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::WorkerExit { code: 4 }));
    }

    #[tokio::test]
    async fn test_http_destination_rejected() {
        let fx = Fixture::new();
        let engine = fx.engine("exit 0", "exit 1");
        let (_tx, mut cancel) = no_cancel();

        let err = engine
            .send(fx.send_job("http://remote.example.com"), &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::InvalidDestination(_)));
    }
}
