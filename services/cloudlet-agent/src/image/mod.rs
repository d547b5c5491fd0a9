//! Base VM images.
//!
//! This module handles:
//! - The catalog property vocabulary of base VM artifacts
//! - Resolving a base disk record into a full descriptor
//! - Caching the four artifacts locally with atomic publish

mod cache;
mod descriptor;

pub use cache::{
    BaseImageCache, BaseImageCacheConfig, CacheError, CacheKey, CacheStats, CacheStatsSnapshot,
};
pub use descriptor::{
    artifact_properties, overlay_properties, recorded_base_hash, ArtifactKind, BaseImageDescriptor, BaseImagePaths,
    ResourceTemplate, PROP_BASE_HASH, PROP_BASE_RESOURCE, PROP_CLOUDLET_TYPE, PROP_IS_CLOUDLET,
    TYPE_OVERLAY,
};
