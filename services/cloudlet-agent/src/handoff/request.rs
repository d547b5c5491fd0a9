//! Request files handed to transfer workers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use cloudlet_id::{BaseHash, HandoffId};
use serde::{Deserialize, Serialize};

use super::preload::ChunkHashDict;
use super::HandoffError;
use crate::image::BaseImagePaths;
use crate::session::{DomainHandle, OverlayTracker};

/// Transfer tuning flags understood by the send worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Skip chunks the guest trimmed.
    pub trim: bool,
    /// Skip memory pages the guest freed.
    pub free: bool,
    /// Transfer disk state only.
    pub disk_only: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            trim: true,
            free: true,
            disk_only: false,
        }
    }
}

/// Snapshot of the live session the send worker takes over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSessionState {
    pub mount_point: PathBuf,
    pub qemu_logfile: PathBuf,
    pub monitor_socket: PathBuf,
    pub delta_pid: Option<u32>,
    pub fs_pid: Option<u32>,
    pub domain_id: u32,
    pub modified_disk_chunks: BTreeSet<u64>,
    pub modified_memory_chunks: BTreeSet<u64>,
    pub hypervisor_uri: String,
}

impl LiveSessionState {
    pub fn capture(domain: &DomainHandle, tracker: &OverlayTracker, hypervisor_uri: String) -> Self {
        Self {
            mount_point: tracker.mount_point.clone(),
            qemu_logfile: tracker.qemu_logfile.clone(),
            monitor_socket: tracker.monitor_socket.clone(),
            delta_pid: tracker.delta_pid,
            fs_pid: tracker.fs_pid,
            domain_id: domain.id,
            modified_disk_chunks: tracker.modified_disk_chunks.clone(),
            modified_memory_chunks: tracker.modified_memory_chunks.clone(),
            hypervisor_uri,
        }
    }
}

/// Send-side request.
///
/// The chunk dictionaries are filled in by the engine after preloading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffSendRequest {
    pub handoff_id: HandoffId,
    pub base_paths: BaseImagePaths,
    pub base_hash: BaseHash,
    #[serde(default)]
    pub disk_hash_dict: ChunkHashDict,
    #[serde(default)]
    pub memory_hash_dict: ChunkHashDict,
    pub options: TransferOptions,
    /// Transfer address in `file://` or `tcp://` form.
    pub destination: String,
    /// Worker-specific transfer mode; `None` selects the worker default.
    pub transfer_mode: Option<String>,
    pub session: LiveSessionState,
}

/// Receive-side request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecvRequest {
    pub handoff_id: HandoffId,
    pub base_paths: BaseImagePaths,
    pub base_hash: BaseHash,
    pub launch_disk_path: PathBuf,
    pub launch_memory_path: PathBuf,
}

pub(crate) async fn write_request<T: Serialize>(
    path: &Path,
    request: &T,
) -> Result<(), HandoffError> {
    let bytes = serde_json::to_vec(request)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn read_request<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, HandoffError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
