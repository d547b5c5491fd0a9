//! Live VM handoff.
//!
//! The engine drives an external transfer worker on both ends of a handoff:
//! - Send: preload base hash indexes, write the request file, run
//!   `send_worker <file>` until it exits
//! - Receive: write the request file, run `recv_worker -d <file>`, parse the
//!   final status line into launch parameters
//!
//! The worker's wire protocol is opaque. Progress is observable through a
//! [`HandoffState`] watch channel.

mod engine;
mod output;
mod preload;
mod request;
mod url;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use cloudlet_id::BaseHash;
use thiserror::Error;

pub use engine::{HandoffEngine, ReceivedHandoff, RecvJob, ResidueFile, SendJob, SendOutcome};
pub use output::{HandoffLaunch, WorkerStatusLine, PLATFORM_KEYWORD};
pub use preload::{preload_hash_index, ChunkHashDict, HASH_RECORD_LEN};
pub use request::{
    HandoffRecvRequest, HandoffSendRequest, LiveSessionState, TransferOptions,
};
pub use url::HandoffDestination;
pub use worker::{TransferWorker, WorkerPoll};

/// Configuration for the handoff engine.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Transfer worker run on the sending host.
    pub send_worker: PathBuf,
    /// Transfer worker run on the receiving host.
    pub recv_worker: PathBuf,
    /// Parent directory of request and residue scratch directories.
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
    /// Longest a running worker may go without output.
    pub max_stall: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            send_worker: PathBuf::from("/usr/local/bin/handoff-proc"),
            recv_worker: PathBuf::from("/usr/local/bin/handoff-server-proc"),
            work_dir: PathBuf::from("/var/lib/cloudlet/handoff"),
            poll_interval: Duration::from_millis(500),
            max_stall: Duration::from_secs(1800),
        }
    }
}

/// Errors from handoff operations.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Transfer worker exited with code {code}")]
    WorkerExit { code: i32 },

    #[error("Malformed handoff output: {0}")]
    MalformedOutput(String),

    #[error("Failed to preload {path}: {reason}")]
    Preload { path: PathBuf, reason: String },

    #[error("Transfer worker stalled for {secs}s")]
    Stalled { secs: u64 },

    #[error("Handoff cancelled")]
    Cancelled,

    #[error("Base hash mismatch: expected {expected}, found {actual}")]
    BaseHashMismatch { expected: BaseHash, actual: BaseHash },

    #[error("Invalid handoff destination: {0}")]
    InvalidDestination(String),

    #[error("Failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress of one side of a handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffState {
    Idle,
    Preloading,
    Transferring,
    Completed,
    Failed(String),
}

impl HandoffState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandoffState::Completed | HandoffState::Failed(_))
    }
}
