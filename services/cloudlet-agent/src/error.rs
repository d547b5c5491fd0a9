//! Errors surfaced by cloudlet operations.

use cloudlet_id::{BaseHash, VmId};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::handoff::HandoffError;
use crate::image::CacheError;
use crate::negotiate::NegotiationError;
use crate::session::SessionError;
use crate::tunnel::TunnelError;

/// Failure of a create-base, spawn, synthesis, handoff or destroy operation.
#[derive(Debug, Error)]
pub enum CloudletError {
    #[error("Artifact {content_hash} unavailable: {reason}")]
    ArtifactUnavailable {
        content_hash: String,
        reason: String,
    },

    #[error("VM {0} is not running")]
    VmNotRunning(VmId),

    #[error("Session already registered for {0}")]
    DuplicateSession(VmId),

    #[error("Handoff failed: {0}")]
    Handoff(HandoffError),

    #[error("Malformed handoff output: {0}")]
    MalformedHandoffOutput(String),

    #[error("Base hash mismatch: expected {expected}, found {actual}")]
    BaseHashMismatch { expected: BaseHash, actual: BaseHash },

    #[error("No matching base VM: {0}")]
    NoMatchingBaseVm(String),

    #[error("No matching network: {0}")]
    NoMatchingNetwork(String),

    #[error("No matching flavor: {0}")]
    NoMatchingFlavor(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(NegotiationError),

    #[error("VM {vm_id} not running after {secs}s")]
    BootTimeout { vm_id: VmId, secs: u64 },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] anyhow::Error),
}

impl From<SessionError> for CloudletError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(vm_id) | SessionError::WrongKind { vm_id, .. } => {
                CloudletError::VmNotRunning(vm_id)
            }
            SessionError::Duplicate(vm_id) => CloudletError::DuplicateSession(vm_id),
        }
    }
}

impl From<CacheError> for CloudletError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable { key, reason } => CloudletError::ArtifactUnavailable {
                content_hash: key.to_string(),
                reason,
            },
            CacheError::Source(e) => CloudletError::Catalog(e),
            CacheError::Io(e) => CloudletError::Io(e),
        }
    }
}

impl From<HandoffError> for CloudletError {
    fn from(err: HandoffError) -> Self {
        match err {
            HandoffError::MalformedOutput(reason) => CloudletError::MalformedHandoffOutput(reason),
            HandoffError::BaseHashMismatch { expected, actual } => {
                CloudletError::BaseHashMismatch { expected, actual }
            }
            other => CloudletError::Handoff(other),
        }
    }
}

impl From<NegotiationError> for CloudletError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::NoMatchingBaseVm { .. } => {
                CloudletError::NoMatchingBaseVm(err.to_string())
            }
            NegotiationError::NoMatchingNetwork { .. } => {
                CloudletError::NoMatchingNetwork(err.to_string())
            }
            NegotiationError::NoMatchingFlavor { .. } => {
                CloudletError::NoMatchingFlavor(err.to_string())
            }
            other => CloudletError::Negotiation(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_map_to_taxonomy() {
        let vm = VmId::new();
        assert!(matches!(
            CloudletError::from(SessionError::NotFound(vm)),
            CloudletError::VmNotRunning(id) if id == vm
        ));
        assert!(matches!(
            CloudletError::from(SessionError::Duplicate(vm)),
            CloudletError::DuplicateSession(id) if id == vm
        ));
    }

    #[test]
    fn test_malformed_output_is_its_own_kind() {
        let err = CloudletError::from(HandoffError::MalformedOutput("bad".to_string()));
        assert!(matches!(err, CloudletError::MalformedHandoffOutput(_)));

        let err = CloudletError::from(HandoffError::WorkerExit { code: 1 });
        assert!(matches!(err, CloudletError::Handoff(HandoffError::WorkerExit { code: 1 })));
    }

    #[test]
    fn test_negotiation_failures_keep_message() {
        let err = CloudletError::from(NegotiationError::NoMatchingFlavor {
            vcpus: 2,
            memory_mb: 4096,
            endpoint: "http://dest".to_string(),
        });
        assert!(matches!(&err, CloudletError::NoMatchingFlavor(msg) if msg.contains("vcpus=2")));
    }
}
