//! Cloudlet orchestration service.
//!
//! Entry points the compute host calls into: create a base, spawn a VM from
//! a base, an overlay or an incoming handoff, finish an overlay, hand a live
//! VM off, and destroy. All components share one base image cache and one
//! session registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudlet_id::{HandoffId, VmId};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::base::BaseImageCreator;
use crate::catalog::{CatalogError, ImageCatalog, ImageRecord};
use crate::config::Config;
use crate::error::CloudletError;
use crate::handoff::{
    HandoffDestination, HandoffEngine, HandoffError, LiveSessionState, RecvJob, SendJob,
    SendOutcome, TransferOptions,
};
use crate::image::{
    overlay_properties, recorded_base_hash, ArtifactKind, BaseImageCache, BaseImageDescriptor,
};
use crate::negotiate::{DestinationClient, DestinationEndpoints, InstanceSpec};
use crate::runtime::{HypervisorSessionHost, PowerState, TaskState};
use crate::session::{
    DomainHandle, ResumedBaseSession, SessionKind, SessionRegistry, SynthesizedSession, VmSession,
};
use crate::synthesis::{OverlayArtifact, OverlaySynthesisController};
use crate::tunnel::{PortForward, TunnelHandle};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Instance metadata that selects how a cloudlet VM is spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpawnMetadata {
    /// Set on a VM created to receive a handoff.
    #[serde(default)]
    pub handoff_info: Option<String>,
    /// Overlay to synthesize the VM from.
    #[serde(default)]
    pub overlay_url: Option<String>,
}

impl SpawnMetadata {
    pub fn is_empty(&self) -> bool {
        self.handoff_info.is_none() && self.overlay_url.is_none()
    }
}

/// How a VM was spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Not a cloudlet image; the platform boots it as usual.
    Plain,
    Launched {
        kind: SessionKind,
        domain: DomainHandle,
    },
}

/// Credentials and lookups for an `http://` handoff destination.
#[derive(Debug, Clone)]
pub struct NegotiationParams {
    pub token: String,
    pub image_url: String,
    pub network_url: String,
    pub display_name: String,
    pub project_id: String,
    pub dest_name: Option<String>,
    pub dest_network: Option<String>,
    pub overlay_url: Option<String>,
}

/// Options of a handoff request.
#[derive(Debug, Clone, Default)]
pub struct HandoffOptions {
    pub transfer: TransferOptions,
    /// Required for `http://` destinations.
    pub negotiation: Option<NegotiationParams>,
}

/// Result of a completed handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub handoff_id: HandoffId,
    /// Where the state was sent, after negotiation.
    pub destination: HandoffDestination,
    /// Catalog entry holding the residue of a `file://` handoff.
    pub residue_image_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The cloudlet service of one compute host.
pub struct CloudletService {
    config: Config,
    host: Arc<dyn HypervisorSessionHost>,
    catalog: Arc<dyn ImageCatalog>,
    cache: Arc<BaseImageCache>,
    sessions: Arc<SessionRegistry>,
    bases: BaseImageCreator,
    overlays: OverlaySynthesisController,
    destinations: DestinationClient,
    shutdown: watch::Sender<bool>,
}

impl CloudletService {
    pub fn new<C>(
        config: Config,
        host: Arc<dyn HypervisorSessionHost>,
        catalog: Arc<C>,
    ) -> Result<Self, CloudletError>
    where
        C: ImageCatalog + 'static,
    {
        let cache = Arc::new(BaseImageCache::new(config.cache(), catalog.clone()));
        let catalog: Arc<dyn ImageCatalog> = catalog;
        let sessions = Arc::new(SessionRegistry::new());
        let bases = BaseImageCreator::new(
            host.clone(),
            catalog.clone(),
            cache.clone(),
            config.work_dir(),
        );
        let overlays = OverlaySynthesisController::new(
            host.clone(),
            catalog.clone(),
            cache.clone(),
            sessions.clone(),
            config.work_dir(),
        );
        let destinations = DestinationClient::new(NEGOTIATION_TIMEOUT)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            host,
            catalog,
            cache,
            sessions,
            bases,
            overlays,
            destinations,
            shutdown,
        })
    }

    /// Prepare local directories and load cached artifacts left by a previous run.
    pub async fn init(&self) -> Result<(), CloudletError> {
        tokio::fs::create_dir_all(self.config.work_dir()).await?;
        tokio::fs::create_dir_all(self.config.handoff().work_dir).await?;
        self.cache.init().await?;
        info!(
            cache_dir = %self.config.cache_dir.display(),
            data_dir = %self.config.data_dir.display(),
            "Cloudlet service initialized"
        );
        Ok(())
    }

    pub fn cache(&self) -> &BaseImageCache {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Cancel in-flight handoffs. Their workers are terminated.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    // =========================================================================
    // Base and overlay creation
    // =========================================================================

    pub async fn create_base(
        &self,
        vm_id: &VmId,
        base_name: &str,
    ) -> Result<BaseImageDescriptor, CloudletError> {
        self.bases.create_base(vm_id, base_name).await
    }

    /// Upload the overlay of a VM resumed from a base.
    pub async fn overlay_finish(
        &self,
        vm_id: &VmId,
        overlay_name: &str,
    ) -> Result<OverlayArtifact, CloudletError> {
        self.overlays.finish(vm_id, overlay_name).await
    }

    // =========================================================================
    // Spawn and destroy
    // =========================================================================

    /// Spawn `vm_id` from `image`, dispatching on the instance metadata.
    pub async fn spawn(
        &self,
        vm_id: &VmId,
        image: &ImageRecord,
        metadata: &SpawnMetadata,
    ) -> Result<SpawnOutcome, CloudletError> {
        let descriptor = match BaseImageDescriptor::from_record(image) {
            Ok(descriptor) => descriptor,
            Err(CatalogError::NotCloudlet { .. }) if metadata.is_empty() => {
                debug!(vm_id = %vm_id, image_id = %image.id, "Not a cloudlet image");
                return Ok(SpawnOutcome::Plain);
            }
            Err(e) => return Err(e.into()),
        };

        if self.sessions.contains(vm_id).await {
            return Err(CloudletError::DuplicateSession(*vm_id));
        }

        let session = if let Some(handoff_info) = &metadata.handoff_info {
            info!(vm_id = %vm_id, handoff_info = %handoff_info, "Spawning from handoff");
            self.spawn_from_handoff(vm_id, &descriptor).await?
        } else if let Some(overlay_url) = &metadata.overlay_url {
            info!(vm_id = %vm_id, overlay_url = %overlay_url, "Spawning from overlay");
            self.spawn_from_overlay(vm_id, &descriptor, overlay_url).await?
        } else {
            info!(vm_id = %vm_id, base_hash = %descriptor.base_hash, "Resuming base VM");
            self.resume_base(vm_id, &descriptor).await?
        };

        let kind = session.kind();
        let domain = match &session {
            VmSession::ResumedBase(s) => s.domain.clone(),
            VmSession::Synthesized(s) => s
                .domain
                .clone()
                .ok_or(CloudletError::VmNotRunning(*vm_id))?,
        };

        if let Err(e) = self.sessions.register(*vm_id, session.clone()).await {
            if let Err(term) = self.host.terminate(session).await {
                warn!(vm_id = %vm_id, error = %term, "Failed to release duplicate session");
            }
            return Err(e.into());
        }

        self.wait_until_running(vm_id).await?;
        info!(vm_id = %vm_id, kind = %kind, domain = %domain.name, "VM spawned");
        Ok(SpawnOutcome::Launched { kind, domain })
    }

    async fn spawn_from_handoff(
        &self,
        vm_id: &VmId,
        descriptor: &BaseImageDescriptor,
    ) -> Result<VmSession, CloudletError> {
        self.verify_base(descriptor).await?;
        let base_paths = self.cache.ensure_base(descriptor).await?;

        let engine = HandoffEngine::new(self.config.handoff());
        let mut cancel = self.shutdown.subscribe();
        let received = engine
            .receive(
                RecvJob {
                    handoff_id: HandoffId::new(),
                    base_paths: base_paths.clone(),
                    base_hash: descriptor.base_hash.clone(),
                },
                &mut cancel,
            )
            .await?;

        let launched = self
            .host
            .launch_handoff(vm_id, &base_paths, &received.launch)
            .await?;
        // Launch artifacts are not needed once the domain runs.
        drop(received);

        Ok(VmSession::Synthesized(SynthesizedSession {
            domain: Some(launched.domain),
            base: descriptor.clone(),
            tracker: launched.tracker,
        }))
    }

    async fn spawn_from_overlay(
        &self,
        vm_id: &VmId,
        descriptor: &BaseImageDescriptor,
        overlay_url: &str,
    ) -> Result<VmSession, CloudletError> {
        let actual = self.host.overlay_base_hash(overlay_url).await?;
        if actual != descriptor.base_hash {
            return Err(CloudletError::BaseHashMismatch {
                expected: descriptor.base_hash.clone(),
                actual,
            });
        }

        let base_paths = self.cache.ensure_base(descriptor).await?;
        let launched = self.host.synthesize(vm_id, &base_paths, overlay_url).await?;

        Ok(VmSession::Synthesized(SynthesizedSession {
            domain: Some(launched.domain),
            base: descriptor.clone(),
            tracker: launched.tracker,
        }))
    }

    async fn resume_base(
        &self,
        vm_id: &VmId,
        descriptor: &BaseImageDescriptor,
    ) -> Result<VmSession, CloudletError> {
        let base_paths = self.cache.ensure_base(descriptor).await?;
        let launched = self
            .host
            .resume_base(vm_id, descriptor, &base_paths)
            .await?;

        Ok(VmSession::ResumedBase(ResumedBaseSession {
            domain: launched.domain,
            base: descriptor.clone(),
            base_paths,
            tracker: launched.tracker,
        }))
    }

    async fn wait_until_running(&self, vm_id: &VmId) -> Result<(), CloudletError> {
        let timeout = self.config.boot_timeout;
        tokio::time::timeout(timeout, self.poll_power_state(vm_id))
            .await
            .map_err(|_| CloudletError::BootTimeout {
                vm_id: *vm_id,
                secs: timeout.as_secs(),
            })?
    }

    async fn poll_power_state(&self, vm_id: &VmId) -> Result<(), CloudletError> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            interval.tick().await;
            match self.host.power_state(vm_id).await? {
                PowerState::Running => return Ok(()),
                state => debug!(vm_id = %vm_id, state = ?state, "Waiting for VM to run"),
            }
        }
    }

    /// Destroy a VM and release its session. Safe to call repeatedly.
    pub async fn destroy(&self, vm_id: &VmId) -> Result<(), CloudletError> {
        self.host.destroy_domain(vm_id).await?;

        let session = match self.sessions.take(vm_id).await {
            Ok(VmSession::Synthesized(mut session)) => {
                // The domain is already gone; only the delta resources remain.
                session.domain = None;
                VmSession::Synthesized(session)
            }
            Ok(session) => session,
            Err(_) => {
                debug!(vm_id = %vm_id, "No cloudlet session to release");
                return Ok(());
            }
        };

        info!(vm_id = %vm_id, kind = %session.kind(), "Releasing cloudlet session");
        self.host.terminate(session).await?;
        Ok(())
    }

    // =========================================================================
    // Handoff
    // =========================================================================

    /// Hand the live state of `vm_id` off to `url`.
    ///
    /// `file://<name>` stores the state as a residue image named `<name>`,
    /// `tcp://host:port` streams it to a waiting receiver and `http://` first
    /// asks the destination deployment for a receiving VM.
    pub async fn handoff(
        &self,
        vm_id: &VmId,
        url: &str,
        options: HandoffOptions,
    ) -> Result<HandoffReport, CloudletError> {
        let destination = HandoffDestination::parse(url)?;
        let domain = self
            .host
            .domain(vm_id)
            .await?
            .ok_or(CloudletError::VmNotRunning(*vm_id))?;
        let session = self.sessions.take_synthesized(vm_id).await?;
        let handoff_id = HandoffId::new();
        let started_at = Utc::now();
        info!(
            vm_id = %vm_id,
            handoff_id = %handoff_id,
            destination = %destination,
            "Starting handoff"
        );

        let sent = self
            .transfer(vm_id, handoff_id, &domain, &session, destination, &options)
            .await;
        let (outcome, destination, residue_entry) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                warn!(
                    vm_id = %vm_id,
                    handoff_id = %handoff_id,
                    error = %e,
                    "Handoff failed, keeping session"
                );
                self.sessions
                    .restore(*vm_id, VmSession::Synthesized(session), self.host.as_ref())
                    .await;
                self.clear_task_state(vm_id).await;
                return Err(e);
            }
        };

        // The state now lives at the destination.
        drop(session);

        let uploaded = self.upload_residue(vm_id, outcome, residue_entry).await;
        self.clear_task_state(vm_id).await;
        let residue_image_id = uploaded?;

        let finished_at = Utc::now();
        info!(
            vm_id = %vm_id,
            handoff_id = %handoff_id,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "Handoff finished"
        );
        Ok(HandoffReport {
            handoff_id,
            destination,
            residue_image_id,
            started_at,
            finished_at,
        })
    }

    async fn transfer(
        &self,
        vm_id: &VmId,
        handoff_id: HandoffId,
        domain: &DomainHandle,
        session: &SynthesizedSession,
        destination: HandoffDestination,
        options: &HandoffOptions,
    ) -> Result<(SendOutcome, HandoffDestination, Option<String>), CloudletError> {
        self.verify_base(&session.base).await?;
        let base_hash = &session.base.base_hash;
        let mut residue_entry = None;

        let destination = match destination {
            HandoffDestination::File(name) => {
                self.host
                    .set_task_state(vm_id, Some(TaskState::ImageSnapshot))
                    .await?;
                let record = self
                    .catalog
                    .create_image(&name, overlay_properties(base_hash))
                    .await?;
                debug!(image_id = %record.id, name = %name, "Reserved residue entry");
                residue_entry = Some(record.id);
                HandoffDestination::File(name)
            }
            HandoffDestination::Http(url) => {
                let params = options.negotiation.as_ref().ok_or_else(|| {
                    HandoffError::InvalidDestination(format!(
                        "{url} requires destination credentials"
                    ))
                })?;
                self.negotiate(url.as_str(), session, params).await?
            }
            tcp @ HandoffDestination::Tcp { .. } => tcp,
        };

        self.host.detach_nic(domain).await?;
        self.host
            .set_task_state(vm_id, Some(TaskState::ImagePendingUpload))
            .await?;

        let base_paths = self.cache.ensure_base(&session.base).await?;
        let job = SendJob {
            handoff_id,
            base_paths,
            base_hash: base_hash.clone(),
            session: LiveSessionState::capture(
                domain,
                &session.tracker,
                self.host.hypervisor_uri(),
            ),
            options: options.transfer,
            destination: destination.clone(),
        };

        let engine = HandoffEngine::new(self.config.handoff());
        let mut cancel = self.shutdown.subscribe();
        let outcome = engine.send(job, &mut cancel).await?;
        Ok((outcome, destination, residue_entry))
    }

    /// Both handoff roles need every base artifact cut from the same base VM
    /// as the disk.
    async fn verify_base(&self, base: &BaseImageDescriptor) -> Result<(), CloudletError> {
        for kind in [
            ArtifactKind::Memory,
            ArtifactKind::DiskHashIndex,
            ArtifactKind::MemoryHashIndex,
        ] {
            let record = self.catalog.show(base.artifact_id(kind)).await?;
            let actual = recorded_base_hash(&record)?;
            if actual != base.base_hash {
                return Err(HandoffError::BaseHashMismatch {
                    expected: base.base_hash.clone(),
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn negotiate(
        &self,
        compute_url: &str,
        session: &SynthesizedSession,
        params: &NegotiationParams,
    ) -> Result<HandoffDestination, CloudletError> {
        let endpoints = DestinationEndpoints {
            compute_url: compute_url.to_string(),
            image_url: params.image_url.clone(),
            network_url: params.network_url.clone(),
        };
        let instance = InstanceSpec {
            display_name: params.display_name.clone(),
            vcpus: session.base.resources.vcpus,
            memory_mb: session.base.resources.memory_mb,
            base_hash: session.base.base_hash.clone(),
            project_id: params.project_id.clone(),
            overlay_url: params.overlay_url.clone(),
        };

        let address = self
            .destinations
            .resolve_and_create(
                &endpoints,
                &params.token,
                &instance,
                params.dest_name.as_deref(),
                params.dest_network.as_deref(),
            )
            .await?;
        info!(
            server_ip = %address.server_ip,
            server_port = address.server_port,
            "Destination ready for handoff"
        );
        Ok(address.destination())
    }

    async fn upload_residue(
        &self,
        vm_id: &VmId,
        outcome: SendOutcome,
        residue_entry: Option<String>,
    ) -> Result<Option<String>, CloudletError> {
        let (Some(residue), Some(image_id)) = (outcome.residue, residue_entry) else {
            return Ok(None);
        };

        self.host
            .set_task_state(vm_id, Some(TaskState::ImageUploading))
            .await?;
        match self
            .catalog
            .upload(&image_id, residue.path(), Default::default())
            .await
        {
            Ok(size) => {
                info!(vm_id = %vm_id, image_id = %image_id, size, "Handoff residue uploaded");
                Ok(Some(image_id))
            }
            Err(e) => {
                error!(
                    vm_id = %vm_id,
                    path = %residue.path().display(),
                    error = %e,
                    "Handoff residue upload failed"
                );
                Err(e.into())
            }
        }
    }

    async fn clear_task_state(&self, vm_id: &VmId) {
        if let Err(e) = self.host.set_task_state(vm_id, None).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to clear task state");
        }
    }

    // =========================================================================
    // Port forwarding
    // =========================================================================

    /// Expose an internal handoff receiver on an ephemeral local port.
    pub async fn forward_port(
        &self,
        dest_ip: &str,
        dest_port: u16,
    ) -> Result<TunnelHandle, CloudletError> {
        let dest = format!("{dest_ip}:{dest_port}");
        let handle = PortForward::new(dest_ip, dest_port)
            .on_client_closed(move || info!(dest = %dest, "Handoff stream forwarded"))
            .start()
            .await?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::runtime::MockHost;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (CloudletService, Arc<MockHost>) {
        let host = Arc::new(MockHost::new());
        let mut config = Config::with_data_dir(dir.path());
        config.poll_interval = Duration::from_millis(5);
        config.boot_timeout = Duration::from_millis(200);
        let service =
            CloudletService::new(config, host.clone(), Arc::new(MemoryCatalog::new())).unwrap();
        (service, host)
    }

    #[test]
    fn test_spawn_metadata_from_instance_metadata() {
        let metadata: SpawnMetadata = serde_json::from_value(serde_json::json!({
            "overlay_url": "http://catalog/overlay",
            "unrelated": "value",
        }))
        .unwrap();
        assert_eq!(metadata.overlay_url.as_deref(), Some("http://catalog/overlay"));
        assert!(metadata.handoff_info.is_none());
        assert!(!metadata.is_empty());
    }

    #[tokio::test]
    async fn test_plain_image_is_not_managed() {
        let dir = TempDir::new().unwrap();
        let (service, _host) = service(&dir);
        service.init().await.unwrap();
        let vm = VmId::new();
        let image = ImageRecord {
            id: "plain".to_string(),
            name: "ubuntu".to_string(),
            size: Some(1),
            properties: Default::default(),
        };

        let outcome = service
            .spawn(&vm, &image, &SpawnMetadata::default())
            .await
            .unwrap();
        assert_eq!(outcome, SpawnOutcome::Plain);
        assert!(service.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_plain_image_with_overlay_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (service, _host) = service(&dir);
        let image = ImageRecord {
            id: "plain".to_string(),
            name: "ubuntu".to_string(),
            size: Some(1),
            properties: Default::default(),
        };
        let metadata = SpawnMetadata {
            overlay_url: Some("http://overlay".to_string()),
            ..Default::default()
        };

        let err = service.spawn(&VmId::new(), &image, &metadata).await.unwrap_err();
        assert!(matches!(err, CloudletError::Catalog(CatalogError::NotCloudlet { .. })));
    }

    #[tokio::test]
    async fn test_destroy_without_session_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (service, host) = service(&dir);
        let vm = VmId::new();
        host.add_running(vm).await;

        service.destroy(&vm).await.unwrap();
        service.destroy(&vm).await.unwrap();
        assert_eq!(host.destroyed().await, vec![vm, vm]);
        assert!(host.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn test_handoff_requires_synthesized_session() {
        let dir = TempDir::new().unwrap();
        let (service, host) = service(&dir);
        let vm = VmId::new();
        host.add_running(vm).await;

        let err = service
            .handoff(&vm, "tcp://10.0.0.1:8022", HandoffOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudletError::VmNotRunning(id) if id == vm));
    }

    #[tokio::test]
    async fn test_handoff_rejects_unknown_scheme() {
        let dir = TempDir::new().unwrap();
        let (service, _host) = service(&dir);

        let err = service
            .handoff(&VmId::new(), "ftp://somewhere", HandoffOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudletError::Handoff(HandoffError::InvalidDestination(_))
        ));
    }
}
