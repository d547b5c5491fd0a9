//! Overlay synthesis.
//!
//! Finishes a VM that was resumed from a base: packages everything it changed
//! since the base into an overlay archive, uploads it and discards the
//! session. The local archive is removed once the upload outcome is known.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudlet_id::{BaseHash, VmId};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::catalog::ImageCatalog;
use crate::error::CloudletError;
use crate::image::{overlay_properties, BaseImageCache};
use crate::runtime::{HypervisorSessionHost, TaskState};
use crate::session::{ResumedBaseSession, SessionRegistry, VmSession};

const SCRATCH_PREFIX: &str = "cloudlet-overlay-";

/// An uploaded overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayArtifact {
    pub image_id: String,
    pub base_hash: BaseHash,
    pub size: u64,
}

/// Produces overlays from resumed-base sessions.
pub struct OverlaySynthesisController {
    host: Arc<dyn HypervisorSessionHost>,
    catalog: Arc<dyn ImageCatalog>,
    cache: Arc<BaseImageCache>,
    sessions: Arc<SessionRegistry>,
    work_dir: PathBuf,
}

impl OverlaySynthesisController {
    pub fn new(
        host: Arc<dyn HypervisorSessionHost>,
        catalog: Arc<dyn ImageCatalog>,
        cache: Arc<BaseImageCache>,
        sessions: Arc<SessionRegistry>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            host,
            catalog,
            cache,
            sessions,
            work_dir,
        }
    }

    /// Package and upload the overlay of `vm_id` under `overlay_name`.
    ///
    /// The session is taken from the registry up front. If packaging fails
    /// it is restored unchanged; once the archive exists the session is
    /// consumed whatever the upload outcome.
    ///
    /// A packaging failure after the NIC detach and pause leaves the domain
    /// paused without its tenant NIC. The restored session still owns it and
    /// `destroy` releases both.
    pub async fn finish(
        &self,
        vm_id: &VmId,
        overlay_name: &str,
    ) -> Result<OverlayArtifact, CloudletError> {
        if self.host.domain(vm_id).await?.is_none() {
            return Err(CloudletError::VmNotRunning(*vm_id));
        }
        let session = self.sessions.take_resumed(vm_id).await?;
        let base_hash = session.base.base_hash.clone();
        info!(vm_id = %vm_id, base_hash = %base_hash, overlay_name, "Creating overlay");

        let (dir, archive) = match self.package(vm_id, &session).await {
            Ok(packaged) => packaged,
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "Overlay packaging failed, keeping session");
                self.sessions
                    .restore(*vm_id, VmSession::ResumedBase(session), self.host.as_ref())
                    .await;
                self.clear_task_state(vm_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.host.terminate(VmSession::ResumedBase(session)).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to release resumed session");
        }

        let result = self.upload(vm_id, overlay_name, &base_hash, &archive).await;
        if let Err(e) = &result {
            error!(
                vm_id = %vm_id,
                path = %archive.display(),
                error = %e,
                "Overlay upload failed"
            );
        }
        drop(dir);
        self.clear_task_state(vm_id).await;

        let artifact = result?;
        info!(
            vm_id = %vm_id,
            image_id = %artifact.image_id,
            size = artifact.size,
            "Overlay uploaded"
        );
        Ok(artifact)
    }

    async fn package(
        &self,
        vm_id: &VmId,
        session: &ResumedBaseSession,
    ) -> Result<(TempDir, PathBuf), CloudletError> {
        self.cache.ensure_base(&session.base).await?;

        self.host.detach_nic(&session.domain).await?;
        self.host.pause_domain(&session.domain).await?;
        self.host
            .set_task_state(vm_id, Some(TaskState::ImagePendingUpload))
            .await?;

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.work_dir)?;
        let archive = self.host.package_overlay(session, dir.path()).await?;
        debug!(vm_id = %vm_id, path = %archive.display(), "Overlay packaged");
        Ok((dir, archive))
    }

    async fn upload(
        &self,
        vm_id: &VmId,
        overlay_name: &str,
        base_hash: &BaseHash,
        archive: &Path,
    ) -> Result<OverlayArtifact, CloudletError> {
        self.host
            .set_task_state(vm_id, Some(TaskState::ImageUploading))
            .await?;
        let record = self
            .catalog
            .create_image(overlay_name, overlay_properties(base_hash))
            .await?;
        let size = self
            .catalog
            .upload(&record.id, archive, Default::default())
            .await?;
        Ok(OverlayArtifact {
            image_id: record.id,
            base_hash: base_hash.clone(),
            size,
        })
    }

    async fn clear_task_state(&self, vm_id: &VmId) {
        if let Err(e) = self.host.set_task_state(vm_id, None).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to clear task state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::image::{
        artifact_properties, ArtifactKind, BaseImageCacheConfig, BaseImageDescriptor,
        BaseImagePaths, ResourceTemplate,
    };
    use crate::runtime::MockHost;
    use crate::session::OverlayTracker;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        dir: TempDir,
        host: Arc<MockHost>,
        catalog: Arc<MemoryCatalog>,
        sessions: Arc<SessionRegistry>,
        controller: OverlaySynthesisController,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(MockHost::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let sessions = Arc::new(SessionRegistry::new());
        let cache = Arc::new(BaseImageCache::new(
            BaseImageCacheConfig {
                cache_dir: dir.path().join("cache"),
            },
            catalog.clone(),
        ));
        let controller = OverlaySynthesisController::new(
            host.clone(),
            catalog.clone(),
            cache,
            sessions.clone(),
            dir.path().join("work"),
        );
        Fixture {
            dir,
            host,
            catalog,
            sessions,
            controller,
        }
    }

    async fn seed_base(catalog: &MemoryCatalog, base_hash: &BaseHash) -> BaseImageDescriptor {
        let mut ids = HashMap::new();
        for kind in ArtifactKind::ALL {
            let props = artifact_properties(base_hash, kind, None).unwrap();
            let id = catalog.insert(kind.suffix(), props, b"base".to_vec()).await;
            ids.insert(kind, id);
        }
        BaseImageDescriptor {
            base_hash: base_hash.clone(),
            disk: ids[&ArtifactKind::Disk].clone(),
            memory: ids[&ArtifactKind::Memory].clone(),
            disk_hash_index: ids[&ArtifactKind::DiskHashIndex].clone(),
            memory_hash_index: ids[&ArtifactKind::MemoryHashIndex].clone(),
            resources: ResourceTemplate {
                vcpus: 1,
                memory_mb: 1024,
                devices: String::new(),
            },
        }
    }

    async fn register_resumed(fx: &Fixture, vm: VmId) -> BaseHash {
        let base_hash = BaseHash::for_instance(&VmId::new());
        let base = seed_base(&fx.catalog, &base_hash).await;
        let domain = fx.host.add_running(vm).await;
        let mut tracker = OverlayTracker::default();
        tracker.modified_disk_chunks.extend([1, 5, 9]);
        fx.sessions
            .register(
                vm,
                VmSession::ResumedBase(ResumedBaseSession {
                    domain,
                    base_paths: BaseImagePaths::in_dir(fx.dir.path(), "b"),
                    base,
                    tracker,
                }),
            )
            .await
            .unwrap();
        base_hash
    }

    fn scratch_dirs(fx: &Fixture) -> usize {
        std::fs::read_dir(fx.dir.path().join("work"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_finish_uploads_overlay_and_consumes_session() {
        let fx = fixture().await;
        let vm = VmId::new();
        let base_hash = register_resumed(&fx, vm).await;

        let artifact = fx.controller.finish(&vm, "my-overlay").await.unwrap();
        assert_eq!(artifact.base_hash, base_hash);

        let data = fx.catalog.data(&artifact.image_id).await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), format!("overlay:{base_hash}:3"));
        let record = fx.catalog.show(&artifact.image_id).await.unwrap();
        assert_eq!(record.property_str("cloudlet_type"), Some("cloudlet_overlay"));

        assert!(!fx.sessions.contains(&vm).await);
        assert_eq!(fx.host.terminated().await.len(), 1);
        assert_eq!(fx.host.detached().await.len(), 1);
        assert!(fx.host.is_paused(&vm).await);
        assert_eq!(scratch_dirs(&fx), 0);
        assert_eq!(
            fx.host.task_history(&vm).await,
            vec![
                Some(TaskState::ImagePendingUpload),
                Some(TaskState::ImageUploading),
                None,
            ]
        );
    }

    #[tokio::test]
    async fn test_finish_without_session() {
        let fx = fixture().await;
        let vm = VmId::new();
        fx.host.add_running(vm).await;

        let err = fx.controller.finish(&vm, "overlay").await.unwrap_err();
        assert!(matches!(err, CloudletError::VmNotRunning(id) if id == vm));
    }

    #[tokio::test]
    async fn test_packaging_failure_restores_session() {
        let fx = fixture().await;
        let vm = VmId::new();
        register_resumed(&fx, vm).await;
        fx.host.fail_packaging(true).await;

        let err = fx.controller.finish(&vm, "overlay").await.unwrap_err();
        assert!(matches!(err, CloudletError::Hypervisor(_)));
        assert!(fx.sessions.contains(&vm).await);
        assert!(fx.host.terminated().await.is_empty());
        // The domain stays paused and detached until destroy.
        assert!(fx.host.is_paused(&vm).await);
        assert_eq!(fx.host.detached().await.len(), 1);
    }

    #[tokio::test]
    async fn test_finish_without_domain() {
        let fx = fixture().await;
        let vm = VmId::new();
        register_resumed(&fx, vm).await;
        fx.host.destroy_domain(&vm).await.unwrap();

        let err = fx.controller.finish(&vm, "overlay").await.unwrap_err();
        assert!(matches!(err, CloudletError::VmNotRunning(id) if id == vm));
        assert!(fx.host.detached().await.is_empty());
        assert!(fx.sessions.contains(&vm).await);
    }

    #[tokio::test]
    async fn test_destroy_during_failed_packaging_releases_session() {
        let fx = fixture().await;
        let vm = VmId::new();
        register_resumed(&fx, vm).await;
        fx.host.fail_packaging(true).await;
        fx.host.set_packaging_delay(Duration::from_millis(300)).await;

        let (result, _) = tokio::join!(fx.controller.finish(&vm, "overlay"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fx.host.destroy_domain(&vm).await.unwrap();
            assert!(fx.sessions.take(&vm).await.is_err());
        });

        assert!(matches!(result.unwrap_err(), CloudletError::Hypervisor(_)));
        assert!(!fx.sessions.contains(&vm).await);
        assert!(matches!(
            fx.host.terminated().await.as_slice(),
            [VmSession::ResumedBase(_)]
        ));
    }

    #[tokio::test]
    async fn test_upload_failure_removes_local_archive() {
        let fx = fixture().await;
        let vm = VmId::new();
        register_resumed(&fx, vm).await;
        fx.catalog.fail_uploads(true);

        let err = fx.controller.finish(&vm, "overlay").await.unwrap_err();
        assert!(matches!(err, CloudletError::Catalog(_)));
        assert!(!fx.sessions.contains(&vm).await);
        assert_eq!(scratch_dirs(&fx), 0);
    }
}
