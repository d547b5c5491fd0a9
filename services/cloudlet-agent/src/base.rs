//! Base VM creation.
//!
//! Turns a running VM into a cloudlet base: four catalog entries, one
//! extraction on the host, and the extracted files published straight into
//! the local cache so the next spawn on this host needs no download.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cloudlet_id::{BaseHash, VmId};
use tracing::{debug, info, warn};

use crate::catalog::ImageCatalog;
use crate::error::CloudletError;
use crate::image::{
    artifact_properties, ArtifactKind, BaseImageCache, BaseImageDescriptor, BaseImagePaths,
    CacheKey, ResourceTemplate,
};
use crate::runtime::{HypervisorSessionHost, TaskState};
use crate::session::DomainHandle;

const SCRATCH_PREFIX: &str = "cloudlet-base-";

/// Creates base VMs from running instances.
pub struct BaseImageCreator {
    host: Arc<dyn HypervisorSessionHost>,
    catalog: Arc<dyn ImageCatalog>,
    cache: Arc<BaseImageCache>,
    work_dir: PathBuf,
}

impl BaseImageCreator {
    pub fn new(
        host: Arc<dyn HypervisorSessionHost>,
        catalog: Arc<dyn ImageCatalog>,
        cache: Arc<BaseImageCache>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            host,
            catalog,
            cache,
            work_dir,
        }
    }

    /// Snapshot `vm_id` into a new base VM named `base_name`.
    pub async fn create_base(
        &self,
        vm_id: &VmId,
        base_name: &str,
    ) -> Result<BaseImageDescriptor, CloudletError> {
        let domain = self
            .host
            .domain(vm_id)
            .await?
            .ok_or(CloudletError::VmNotRunning(*vm_id))?;
        let base_hash = BaseHash::for_instance(vm_id);

        info!(vm_id = %vm_id, base_hash = %base_hash, base_name, "Creating base VM");
        self.host
            .set_task_state(vm_id, Some(TaskState::ImageSnapshot))
            .await?;

        let result = self.snapshot(vm_id, &domain, base_name, &base_hash).await;

        // The instance must not be left in a snapshot state either way.
        if let Err(e) = self.host.set_task_state(vm_id, None).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to clear task state");
        }

        match &result {
            Ok(descriptor) => info!(
                vm_id = %vm_id,
                base_hash = %base_hash,
                disk_image = %descriptor.disk,
                "Base VM created"
            ),
            Err(e) => warn!(
                vm_id = %vm_id,
                base_hash = %base_hash,
                error = %e,
                "Base VM creation failed"
            ),
        }
        result
    }

    async fn snapshot(
        &self,
        vm_id: &VmId,
        domain: &DomainHandle,
        base_name: &str,
        base_hash: &BaseHash,
    ) -> Result<BaseImageDescriptor, CloudletError> {
        let ids = self.reserve_entries(base_name, base_hash).await?;

        self.host.pause_domain(domain).await?;

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.work_dir)?;
        let out = BaseImagePaths::in_dir(scratch.path(), base_hash.as_str());
        let resources = self.host.extract_base(domain, &out).await?;
        debug!(
            vm_id = %vm_id,
            vcpus = resources.vcpus,
            memory_mb = resources.memory_mb,
            "Extracted base VM state"
        );

        self.host
            .set_task_state(vm_id, Some(TaskState::ImagePendingUpload))
            .await?;
        self.host
            .set_task_state(vm_id, Some(TaskState::ImageUploading))
            .await?;

        for kind in ArtifactKind::ALL {
            let properties = match kind {
                ArtifactKind::Disk => artifact_properties(base_hash, kind, Some(&resources))?,
                _ => Default::default(),
            };
            let size = self
                .catalog
                .upload(&ids[&kind], out.get(kind), properties)
                .await?;
            debug!(image_id = %ids[&kind], kind = ?kind, size, "Uploaded base artifact");
        }

        for kind in ArtifactKind::ALL {
            self.cache
                .adopt(&CacheKey::for_artifact(base_hash, kind), out.get(kind))
                .await?;
        }

        Ok(descriptor(base_hash, &ids, resources))
    }

    /// Register the four catalog entries. The disk entry goes last and
    /// references the other three.
    async fn reserve_entries(
        &self,
        base_name: &str,
        base_hash: &BaseHash,
    ) -> Result<HashMap<ArtifactKind, String>, CloudletError> {
        let mut ids: HashMap<ArtifactKind, String> = HashMap::new();
        for kind in ArtifactKind::ALL {
            let mut properties = artifact_properties(base_hash, kind, None)?;
            if kind == ArtifactKind::Disk {
                for (other, id) in &ids {
                    properties.insert(other.cloudlet_type().to_string(), id.clone().into());
                }
            }
            let name = format!("{base_name}{}", kind.suffix());
            let record = self.catalog.create_image(&name, properties).await?;
            debug!(image_id = %record.id, name = %name, "Reserved catalog entry");
            ids.insert(kind, record.id);
        }
        Ok(ids)
    }
}

fn descriptor(
    base_hash: &BaseHash,
    ids: &HashMap<ArtifactKind, String>,
    resources: ResourceTemplate,
) -> BaseImageDescriptor {
    let id = |kind: ArtifactKind| ids.get(&kind).cloned().unwrap_or_default();
    BaseImageDescriptor {
        base_hash: base_hash.clone(),
        disk: id(ArtifactKind::Disk),
        memory: id(ArtifactKind::Memory),
        disk_hash_index: id(ArtifactKind::DiskHashIndex),
        memory_hash_index: id(ArtifactKind::MemoryHashIndex),
        resources,
    }
}
