//! Base VM descriptors and the catalog property vocabulary.
//!
//! A base VM is published as four catalog entries. The disk entry is the one
//! users boot from; it carries the ids of the other three in its properties.

use std::path::{Path, PathBuf};

use cloudlet_id::BaseHash;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogError, ImageProperties, ImageRecord};

/// Marks an image as managed by the cloudlet agent.
pub const PROP_IS_CLOUDLET: &str = "is_cloudlet";
/// Artifact kind of a cloudlet image.
pub const PROP_CLOUDLET_TYPE: &str = "cloudlet_type";
/// Content hash of the base VM an artifact belongs to.
pub const PROP_BASE_HASH: &str = "base_sha256_uuid";
/// Serialized [`ResourceTemplate`] of the base VM.
pub const PROP_BASE_RESOURCE: &str = "base_resource_xml_str";

/// `cloudlet_type` of an uploaded overlay or handoff residue.
pub const TYPE_OVERLAY: &str = "cloudlet_overlay";

/// One of the four artifacts making up a base VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Disk,
    Memory,
    DiskHashIndex,
    MemoryHashIndex,
}

impl ArtifactKind {
    /// Catalog registration order. The disk goes last since it references the others.
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Memory,
        ArtifactKind::DiskHashIndex,
        ArtifactKind::MemoryHashIndex,
        ArtifactKind::Disk,
    ];

    /// Value of the `cloudlet_type` property.
    pub fn cloudlet_type(self) -> &'static str {
        match self {
            ArtifactKind::Disk => "cloudlet_base_disk",
            ArtifactKind::Memory => "cloudlet_base_memory",
            ArtifactKind::DiskHashIndex => "cloudlet_base_disk_hash",
            ArtifactKind::MemoryHashIndex => "cloudlet_base_memory_hash",
        }
    }

    /// Suffix appended to the base name for catalog entries and cache files.
    pub fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Disk => "-disk",
            ArtifactKind::Memory => "-mem",
            ArtifactKind::DiskHashIndex => "-disk-meta",
            ArtifactKind::MemoryHashIndex => "-mem-meta",
        }
    }

    /// Parse a suffix back into a kind.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.suffix() == suffix)
    }
}

/// Virtual hardware of a base VM.
///
/// Used to pick a matching flavor on a destination deployment and to rebuild
/// the domain definition when the base is resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    pub vcpus: u32,
    pub memory_mb: u64,
    /// Opaque device topology handed back to the hypervisor host.
    #[serde(default)]
    pub devices: String,
}

/// Identifies a base VM and the catalog ids of its four artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImageDescriptor {
    pub base_hash: BaseHash,
    pub disk: String,
    pub memory: String,
    pub disk_hash_index: String,
    pub memory_hash_index: String,
    pub resources: ResourceTemplate,
}

impl BaseImageDescriptor {
    /// Build a descriptor from the catalog record of a base disk.
    pub fn from_record(record: &ImageRecord) -> Result<Self, CatalogError> {
        let not_cloudlet = |reason: String| CatalogError::NotCloudlet {
            image_id: record.id.clone(),
            reason,
        };

        match record.property_str(PROP_CLOUDLET_TYPE) {
            Some(kind) if kind == ArtifactKind::Disk.cloudlet_type() => {}
            Some(kind) => return Err(not_cloudlet(format!("unexpected type {kind}"))),
            None => return Err(not_cloudlet(format!("missing {PROP_CLOUDLET_TYPE}"))),
        }

        let base_hash = record
            .property_str(PROP_BASE_HASH)
            .ok_or_else(|| not_cloudlet(format!("missing {PROP_BASE_HASH}")))?
            .parse::<BaseHash>()
            .map_err(|e| not_cloudlet(e.to_string()))?;

        let reference = |kind: ArtifactKind| {
            record
                .property_str(kind.cloudlet_type())
                .map(str::to_string)
                .ok_or_else(|| not_cloudlet(format!("missing {}", kind.cloudlet_type())))
        };

        let resources = record
            .property_str(PROP_BASE_RESOURCE)
            .ok_or_else(|| not_cloudlet(format!("missing {PROP_BASE_RESOURCE}")))
            .and_then(|raw| {
                serde_json::from_str::<ResourceTemplate>(raw).map_err(|e| not_cloudlet(e.to_string()))
            })?;

        Ok(Self {
            base_hash,
            disk: record.id.clone(),
            memory: reference(ArtifactKind::Memory)?,
            disk_hash_index: reference(ArtifactKind::DiskHashIndex)?,
            memory_hash_index: reference(ArtifactKind::MemoryHashIndex)?,
            resources,
        })
    }

    /// Catalog id of one artifact.
    pub fn artifact_id(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Disk => &self.disk,
            ArtifactKind::Memory => &self.memory,
            ArtifactKind::DiskHashIndex => &self.disk_hash_index,
            ArtifactKind::MemoryHashIndex => &self.memory_hash_index,
        }
    }
}

/// Base hash an artifact record was tagged with.
pub fn recorded_base_hash(record: &ImageRecord) -> Result<BaseHash, CatalogError> {
    record
        .property_str(PROP_BASE_HASH)
        .ok_or_else(|| CatalogError::NotCloudlet {
            image_id: record.id.clone(),
            reason: format!("missing {PROP_BASE_HASH}"),
        })?
        .parse::<BaseHash>()
        .map_err(|e| CatalogError::NotCloudlet {
            image_id: record.id.clone(),
            reason: e.to_string(),
        })
}

/// Properties shared by every artifact of a base VM.
pub fn artifact_properties(
    base_hash: &BaseHash,
    kind: ArtifactKind,
    resources: Option<&ResourceTemplate>,
) -> Result<ImageProperties, CatalogError> {
    let mut props = ImageProperties::new();
    props.insert(PROP_IS_CLOUDLET.to_string(), true.into());
    props.insert(PROP_CLOUDLET_TYPE.to_string(), kind.cloudlet_type().into());
    props.insert(PROP_BASE_HASH.to_string(), base_hash.as_str().into());
    if let Some(resources) = resources {
        props.insert(
            PROP_BASE_RESOURCE.to_string(),
            serde_json::to_string(resources)?.into(),
        );
    }
    Ok(props)
}

/// Properties of an uploaded overlay or residue archive.
pub fn overlay_properties(base_hash: &BaseHash) -> ImageProperties {
    let mut props = ImageProperties::new();
    props.insert(PROP_IS_CLOUDLET.to_string(), true.into());
    props.insert(PROP_CLOUDLET_TYPE.to_string(), TYPE_OVERLAY.into());
    props.insert(PROP_BASE_HASH.to_string(), base_hash.as_str().into());
    props
}

/// Local paths of the four cached artifacts of a base VM.
///
/// Serialized as a fixed four-element array in disk, memory, disk hash
/// index, memory hash index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[PathBuf; 4]", into = "[PathBuf; 4]")]
pub struct BaseImagePaths {
    pub disk: PathBuf,
    pub memory: PathBuf,
    pub disk_hash_index: PathBuf,
    pub memory_hash_index: PathBuf,
}

impl BaseImagePaths {
    /// Paths for `base_name` with the standard suffixes inside `dir`.
    pub fn in_dir(dir: &Path, base_name: &str) -> Self {
        let path = |kind: ArtifactKind| dir.join(format!("{base_name}{}", kind.suffix()));
        Self {
            disk: path(ArtifactKind::Disk),
            memory: path(ArtifactKind::Memory),
            disk_hash_index: path(ArtifactKind::DiskHashIndex),
            memory_hash_index: path(ArtifactKind::MemoryHashIndex),
        }
    }

    pub fn get(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Disk => &self.disk,
            ArtifactKind::Memory => &self.memory,
            ArtifactKind::DiskHashIndex => &self.disk_hash_index,
            ArtifactKind::MemoryHashIndex => &self.memory_hash_index,
        }
    }
}

impl From<[PathBuf; 4]> for BaseImagePaths {
    fn from([disk, memory, disk_hash_index, memory_hash_index]: [PathBuf; 4]) -> Self {
        Self {
            disk,
            memory,
            disk_hash_index,
            memory_hash_index,
        }
    }
}

impl From<BaseImagePaths> for [PathBuf; 4] {
    fn from(paths: BaseImagePaths) -> Self {
        [
            paths.disk,
            paths.memory,
            paths.disk_hash_index,
            paths.memory_hash_index,
        ]
    }
}
