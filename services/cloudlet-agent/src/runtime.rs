//! Hypervisor host interface and mock implementation.
//!
//! The orchestration core never talks to the hypervisor directly. It depends
//! on [`HypervisorSessionHost`], which covers:
//! - Domain lookup, power state, pause, NIC detach, destroy
//! - Task state bookkeeping on the instance record
//! - Base extraction, base resume, overlay synthesis and handoff launch
//! - Overlay packaging and session teardown
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cloudlet_id::{BaseHash, VmId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::handoff::HandoffLaunch;
use crate::image::{BaseImageDescriptor, BaseImagePaths, ResourceTemplate};
use crate::session::{DomainHandle, OverlayTracker, ResumedBaseSession, VmSession};

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    NoState,
    Running,
    Paused,
    Shutdown,
}

/// Long-running task state recorded on the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    ImageSnapshot,
    ImagePendingUpload,
    ImageUploading,
}

/// A domain started by the host together with its delta tracking.
#[derive(Debug, Clone)]
pub struct LaunchedVm {
    pub domain: DomainHandle,
    pub tracker: OverlayTracker,
}

/// Capabilities the cloudlet core needs from the hypervisor host.
#[async_trait]
pub trait HypervisorSessionHost: Send + Sync {
    /// Running domain of a VM, if any.
    async fn domain(&self, vm_id: &VmId) -> Result<Option<DomainHandle>>;

    async fn power_state(&self, vm_id: &VmId) -> Result<PowerState>;

    async fn pause_domain(&self, domain: &DomainHandle) -> Result<()>;

    /// Detach the tenant network interface before state is extracted.
    async fn detach_nic(&self, domain: &DomainHandle) -> Result<()>;

    /// Destroy the VM's domain. A missing domain is not an error.
    async fn destroy_domain(&self, vm_id: &VmId) -> Result<()>;

    /// Record the VM's task state; `None` clears it.
    async fn set_task_state(&self, vm_id: &VmId, state: Option<TaskState>) -> Result<()>;

    /// Write disk, memory snapshot and both hash indexes of a paused VM to
    /// `out`, returning its virtual hardware.
    async fn extract_base(
        &self,
        domain: &DomainHandle,
        out: &BaseImagePaths,
    ) -> Result<ResourceTemplate>;

    /// Resume a VM from cached base artifacts with delta tracking attached.
    async fn resume_base(
        &self,
        vm_id: &VmId,
        base: &BaseImageDescriptor,
        paths: &BaseImagePaths,
    ) -> Result<LaunchedVm>;

    /// Base hash recorded in an overlay package.
    async fn overlay_base_hash(&self, overlay_url: &str) -> Result<BaseHash>;

    /// Reconstruct a VM from cached base artifacts and an overlay.
    async fn synthesize(
        &self,
        vm_id: &VmId,
        paths: &BaseImagePaths,
        overlay_url: &str,
    ) -> Result<LaunchedVm>;

    /// Start a VM from the launch artifacts produced by a received handoff.
    async fn launch_handoff(
        &self,
        vm_id: &VmId,
        paths: &BaseImagePaths,
        launch: &HandoffLaunch,
    ) -> Result<LaunchedVm>;

    /// Materialize the changes of a resumed base into an overlay archive in `out_dir`.
    async fn package_overlay(&self, session: &ResumedBaseSession, out_dir: &Path)
        -> Result<PathBuf>;

    /// Release a session's mount, delta processes and domain handle.
    async fn terminate(&self, session: VmSession) -> Result<()>;

    /// Connection URI handed to transfer workers.
    fn hypervisor_uri(&self) -> String;
}

// =============================================================================
// Mock Host
// =============================================================================

#[derive(Debug)]
struct MockDomain {
    handle: DomainHandle,
    /// Power state queries left before the domain reports running.
    boot_polls: u32,
    paused: bool,
}

#[derive(Debug, Default)]
struct MockHostState {
    domains: HashMap<VmId, MockDomain>,
    next_domain_id: u32,
    boot_polls: u32,
    task_history: Vec<(VmId, Option<TaskState>)>,
    extract_calls: u32,
    detached: Vec<DomainHandle>,
    destroyed: Vec<VmId>,
    terminated: Vec<VmSession>,
    overlay_hashes: HashMap<String, BaseHash>,
    launches: Vec<HandoffLaunch>,
    fail_packaging: bool,
    packaging_delay: Duration,
}

/// Mock hypervisor host for testing and development.
#[derive(Debug, Default)]
pub struct MockHost {
    state: Mutex<MockHostState>,
}

impl MockHost {
    /// Create a new mock host with no domains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running domain for `vm_id`.
    pub async fn add_running(&self, vm_id: VmId) -> DomainHandle {
        let mut state = self.state.lock().await;
        Self::start_domain(&mut state, vm_id, 0)
    }

    fn start_domain(state: &mut MockHostState, vm_id: VmId, boot_polls: u32) -> DomainHandle {
        state.next_domain_id += 1;
        let handle = DomainHandle {
            id: state.next_domain_id,
            name: format!("instance-{:08x}", state.next_domain_id),
        };
        state.domains.insert(
            vm_id,
            MockDomain {
                handle: handle.clone(),
                boot_polls,
                paused: false,
            },
        );
        handle
    }

    fn launched(state: &mut MockHostState, vm_id: &VmId, mount: &Path) -> LaunchedVm {
        let boot_polls = state.boot_polls;
        let domain = Self::start_domain(state, *vm_id, boot_polls);
        LaunchedVm {
            domain,
            tracker: OverlayTracker {
                mount_point: mount.to_path_buf(),
                delta_pid: Some(4000 + state.next_domain_id),
                fs_pid: Some(5000 + state.next_domain_id),
                qemu_logfile: PathBuf::from(format!("/tmp/qemu-{vm_id}.log")),
                monitor_socket: PathBuf::from(format!("/tmp/qmp-{vm_id}.sock")),
                ..Default::default()
            },
        }
    }

    /// Number of power state queries domains launched from now on answer
    /// with `NoState` before reporting `Running`.
    pub async fn set_boot_polls(&self, polls: u32) {
        self.state.lock().await.boot_polls = polls;
    }

    /// Base hash reported for an overlay URL.
    pub async fn set_overlay_hash(&self, overlay_url: &str, base_hash: BaseHash) {
        self.state
            .lock()
            .await
            .overlay_hashes
            .insert(overlay_url.to_string(), base_hash);
    }

    /// Make overlay packaging fail.
    pub async fn fail_packaging(&self, fail: bool) {
        self.state.lock().await.fail_packaging = fail;
    }

    /// Make overlay packaging take `delay` before it completes or fails.
    pub async fn set_packaging_delay(&self, delay: Duration) {
        self.state.lock().await.packaging_delay = delay;
    }

    /// Task states recorded for `vm_id`, in order.
    pub async fn task_history(&self, vm_id: &VmId) -> Vec<Option<TaskState>> {
        self.state
            .lock()
            .await
            .task_history
            .iter()
            .filter(|(id, _)| id == vm_id)
            .map(|(_, state)| *state)
            .collect()
    }

    pub async fn extract_count(&self) -> u32 {
        self.state.lock().await.extract_calls
    }

    pub async fn detached(&self) -> Vec<DomainHandle> {
        self.state.lock().await.detached.clone()
    }

    pub async fn destroyed(&self) -> Vec<VmId> {
        self.state.lock().await.destroyed.clone()
    }

    pub async fn terminated(&self) -> Vec<VmSession> {
        self.state.lock().await.terminated.clone()
    }

    pub async fn launches(&self) -> Vec<HandoffLaunch> {
        self.state.lock().await.launches.clone()
    }

    pub async fn is_paused(&self, vm_id: &VmId) -> bool {
        self.state
            .lock()
            .await
            .domains
            .get(vm_id)
            .map(|domain| domain.paused)
            .unwrap_or(false)
    }
}

#[async_trait]
impl HypervisorSessionHost for MockHost {
    async fn domain(&self, vm_id: &VmId) -> Result<Option<DomainHandle>> {
        Ok(self
            .state
            .lock()
            .await
            .domains
            .get(vm_id)
            .map(|domain| domain.handle.clone()))
    }

    async fn power_state(&self, vm_id: &VmId) -> Result<PowerState> {
        let mut state = self.state.lock().await;
        let Some(domain) = state.domains.get_mut(vm_id) else {
            return Ok(PowerState::Shutdown);
        };
        if domain.boot_polls > 0 {
            domain.boot_polls -= 1;
            return Ok(PowerState::NoState);
        }
        Ok(if domain.paused {
            PowerState::Paused
        } else {
            PowerState::Running
        })
    }

    async fn pause_domain(&self, domain: &DomainHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .domains
            .values_mut()
            .find(|d| d.handle == *domain)
            .ok_or_else(|| anyhow::anyhow!("domain {} not found", domain.name))?;
        entry.paused = true;
        debug!(domain = %domain.name, "[MOCK] Paused domain");
        Ok(())
    }

    async fn detach_nic(&self, domain: &DomainHandle) -> Result<()> {
        self.state.lock().await.detached.push(domain.clone());
        Ok(())
    }

    async fn destroy_domain(&self, vm_id: &VmId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.domains.remove(vm_id);
        state.destroyed.push(*vm_id);
        info!(vm_id = %vm_id, "[MOCK] Destroyed domain");
        Ok(())
    }

    async fn set_task_state(&self, vm_id: &VmId, task: Option<TaskState>) -> Result<()> {
        self.state.lock().await.task_history.push((*vm_id, task));
        Ok(())
    }

    async fn extract_base(
        &self,
        domain: &DomainHandle,
        out: &BaseImagePaths,
    ) -> Result<ResourceTemplate> {
        self.state.lock().await.extract_calls += 1;

        tokio::fs::write(&out.disk, format!("disk:{}", domain.name)).await?;
        tokio::fs::write(&out.memory, format!("memory:{}", domain.name)).await?;
        // Hash indexes of an untouched base carry no records.
        tokio::fs::write(&out.disk_hash_index, b"").await?;
        tokio::fs::write(&out.memory_hash_index, b"").await?;

        Ok(ResourceTemplate {
            vcpus: 2,
            memory_mb: 4096,
            devices: "<devices/>".to_string(),
        })
    }

    async fn resume_base(
        &self,
        vm_id: &VmId,
        _base: &BaseImageDescriptor,
        paths: &BaseImagePaths,
    ) -> Result<LaunchedVm> {
        let mut state = self.state.lock().await;
        let mount = paths.disk.with_extension("mnt");
        Ok(Self::launched(&mut state, vm_id, &mount))
    }

    async fn overlay_base_hash(&self, overlay_url: &str) -> Result<BaseHash> {
        self.state
            .lock()
            .await
            .overlay_hashes
            .get(overlay_url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("overlay {overlay_url} not found"))
    }

    async fn synthesize(
        &self,
        vm_id: &VmId,
        paths: &BaseImagePaths,
        _overlay_url: &str,
    ) -> Result<LaunchedVm> {
        let mut state = self.state.lock().await;
        let mount = paths.disk.with_extension("synth");
        Ok(Self::launched(&mut state, vm_id, &mount))
    }

    async fn launch_handoff(
        &self,
        vm_id: &VmId,
        paths: &BaseImagePaths,
        launch: &HandoffLaunch,
    ) -> Result<LaunchedVm> {
        let mut state = self.state.lock().await;
        state.launches.push(launch.clone());
        let mount = paths.disk.with_extension("handoff");
        Ok(Self::launched(&mut state, vm_id, &mount))
    }

    async fn package_overlay(
        &self,
        session: &ResumedBaseSession,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        let (fail, delay) = {
            let state = self.state.lock().await;
            (state.fail_packaging, state.packaging_delay)
        };
        tokio::time::sleep(delay).await;
        if fail {
            anyhow::bail!("Mock host configured to fail packaging");
        }
        let path = out_dir.join("overlay.zip");
        let chunks = session.tracker.modified_disk_chunks.len()
            + session.tracker.modified_memory_chunks.len();
        tokio::fs::write(&path, format!("overlay:{}:{chunks}", session.base.base_hash)).await?;
        Ok(path)
    }

    async fn terminate(&self, session: VmSession) -> Result<()> {
        debug!(kind = %session.kind(), "[MOCK] Terminating session");
        self.state.lock().await.terminated.push(session);
        Ok(())
    }

    fn hypervisor_uri(&self) -> String {
        "qemu:///system".to_string()
    }
}
