//! Live VM sessions.
//!
//! A session exists while a VM runs on top of a cloudlet base: either resumed
//! straight from the base (and accumulating changes that become an overlay)
//! or synthesized from an overlay or an incoming handoff.

mod registry;

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::image::{BaseImageDescriptor, BaseImagePaths};

pub use registry::{SessionError, SessionRegistry};

// =============================================================================
// Session State
// =============================================================================

/// Handle to a running hypervisor domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainHandle {
    /// Hypervisor-assigned domain id.
    pub id: u32,
    /// Domain name.
    pub name: String,
}

/// Delta tracking attached to a VM running on top of a base.
///
/// The filesystem process exposes the overlaid disk and memory at
/// `mount_point`; the delta process records which chunks the guest touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayTracker {
    pub mount_point: PathBuf,
    pub delta_pid: Option<u32>,
    pub fs_pid: Option<u32>,
    pub modified_disk_chunks: BTreeSet<u64>,
    pub modified_memory_chunks: BTreeSet<u64>,
    pub qemu_logfile: PathBuf,
    pub monitor_socket: PathBuf,
}

/// VM resumed directly from a cached base.
#[derive(Debug, Clone)]
pub struct ResumedBaseSession {
    pub domain: DomainHandle,
    pub base: BaseImageDescriptor,
    pub base_paths: BaseImagePaths,
    pub tracker: OverlayTracker,
}

/// VM reconstructed from an overlay or a received handoff.
#[derive(Debug, Clone)]
pub struct SynthesizedSession {
    /// Cleared once the domain has been destroyed externally.
    pub domain: Option<DomainHandle>,
    pub base: BaseImageDescriptor,
    pub tracker: OverlayTracker,
}

/// A registered session.
#[derive(Debug, Clone)]
pub enum VmSession {
    ResumedBase(ResumedBaseSession),
    Synthesized(SynthesizedSession),
}

impl VmSession {
    pub fn kind(&self) -> SessionKind {
        match self {
            VmSession::ResumedBase(_) => SessionKind::ResumedBase,
            VmSession::Synthesized(_) => SessionKind::Synthesized,
        }
    }

    pub fn base(&self) -> &BaseImageDescriptor {
        match self {
            VmSession::ResumedBase(session) => &session.base,
            VmSession::Synthesized(session) => &session.base,
        }
    }

    pub fn tracker(&self) -> &OverlayTracker {
        match self {
            VmSession::ResumedBase(session) => &session.tracker,
            VmSession::Synthesized(session) => &session.tracker,
        }
    }
}

/// Variant tag of a [`VmSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    ResumedBase,
    Synthesized,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::ResumedBase => write!(f, "resumed-base"),
            SessionKind::Synthesized => write!(f, "synthesized"),
        }
    }
}
