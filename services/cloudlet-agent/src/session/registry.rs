//! Registry of live VM sessions.
//!
//! At most one session exists per VM. Operations that extract a VM's state
//! (overlay synthesis, handoff send) `take` the session, which removes it
//! under the write lock, so two of them can never run against the same VM.

use std::collections::HashMap;

use cloudlet_id::VmId;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ResumedBaseSession, SessionKind, SynthesizedSession, VmSession};
use crate::runtime::HypervisorSessionHost;

/// Errors from registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("No session registered for {0}")]
    NotFound(VmId),

    #[error("Session already registered for {0}")]
    Duplicate(VmId),

    #[error("Session for {vm_id} is {actual}, expected {expected}")]
    WrongKind {
        vm_id: VmId,
        expected: SessionKind,
        actual: SessionKind,
    },
}

/// Process-wide map from VM id to its live session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<VmId, VmSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails if one is already registered for the VM.
    pub async fn register(&self, vm_id: VmId, session: VmSession) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&vm_id) {
            return Err(SessionError::Duplicate(vm_id));
        }
        debug!(vm_id = %vm_id, kind = %session.kind(), "Registering session");
        sessions.insert(vm_id, session);
        Ok(())
    }

    /// Remove and return the session.
    pub async fn take(&self, vm_id: &VmId) -> Result<VmSession, SessionError> {
        self.sessions
            .write()
            .await
            .remove(vm_id)
            .ok_or(SessionError::NotFound(*vm_id))
    }

    /// Remove and return a resumed-base session. Any other variant stays registered.
    pub async fn take_resumed(&self, vm_id: &VmId) -> Result<ResumedBaseSession, SessionError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(vm_id).map(VmSession::kind) {
            None => Err(SessionError::NotFound(*vm_id)),
            Some(SessionKind::ResumedBase) => match sessions.remove(vm_id) {
                Some(VmSession::ResumedBase(session)) => Ok(session),
                _ => Err(SessionError::NotFound(*vm_id)),
            },
            Some(actual) => Err(SessionError::WrongKind {
                vm_id: *vm_id,
                expected: SessionKind::ResumedBase,
                actual,
            }),
        }
    }

    /// Remove and return a synthesized session. Any other variant stays registered.
    pub async fn take_synthesized(
        &self,
        vm_id: &VmId,
    ) -> Result<SynthesizedSession, SessionError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(vm_id).map(VmSession::kind) {
            None => Err(SessionError::NotFound(*vm_id)),
            Some(SessionKind::Synthesized) => match sessions.remove(vm_id) {
                Some(VmSession::Synthesized(session)) => Ok(session),
                _ => Err(SessionError::NotFound(*vm_id)),
            },
            Some(actual) => Err(SessionError::WrongKind {
                vm_id: *vm_id,
                expected: SessionKind::Synthesized,
                actual,
            }),
        }
    }

    /// Put back a session taken by an operation that failed before the VM's
    /// state left the host.
    ///
    /// The domain is checked after the session is back in the map. A destroy
    /// that removes the domain later finds the session; one that removed it
    /// earlier is seen here, and the session is released through `host`.
    pub async fn restore(
        &self,
        vm_id: VmId,
        session: VmSession,
        host: &dyn HypervisorSessionHost,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&vm_id) {
                drop(sessions);
                warn!(vm_id = %vm_id, "Session already registered, releasing restored one");
                release(host, &vm_id, session).await;
                return;
            }
            sessions.insert(vm_id, session);
        }

        match host.domain(&vm_id).await {
            Ok(Some(_)) => debug!(vm_id = %vm_id, "Session restored"),
            Ok(None) => {
                if let Ok(session) = self.take(&vm_id).await {
                    info!(vm_id = %vm_id, "VM destroyed while its session was out, releasing");
                    release(host, &vm_id, session).await;
                }
            }
            Err(e) => warn!(vm_id = %vm_id, error = %e, "Domain lookup failed, keeping session"),
        }
    }

    /// Copy of the session without removing it.
    pub async fn peek(&self, vm_id: &VmId) -> Result<VmSession, SessionError> {
        self.sessions
            .read()
            .await
            .get(vm_id)
            .cloned()
            .ok_or(SessionError::NotFound(*vm_id))
    }

    pub async fn contains(&self, vm_id: &VmId) -> bool {
        self.sessions.read().await.contains_key(vm_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

async fn release(host: &dyn HypervisorSessionHost, vm_id: &VmId, session: VmSession) {
    let session = match session {
        VmSession::Synthesized(mut session) => {
            session.domain = None;
            VmSession::Synthesized(session)
        }
        other => other,
    };
    if let Err(e) = host.terminate(session).await {
        warn!(vm_id = %vm_id, error = %e, "Failed to release session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{BaseImageDescriptor, BaseImagePaths, ResourceTemplate};
    use crate::runtime::MockHost;
    use crate::session::{DomainHandle, OverlayTracker};
    use cloudlet_id::BaseHash;
    use std::path::Path;
    use std::sync::Arc;

    fn descriptor() -> BaseImageDescriptor {
        BaseImageDescriptor {
            base_hash: BaseHash::for_instance(&VmId::new()),
            disk: "disk".to_string(),
            memory: "mem".to_string(),
            disk_hash_index: "disk-meta".to_string(),
            memory_hash_index: "mem-meta".to_string(),
            resources: ResourceTemplate {
                vcpus: 1,
                memory_mb: 1024,
                devices: String::new(),
            },
        }
    }

    fn resumed() -> VmSession {
        VmSession::ResumedBase(ResumedBaseSession {
            domain: DomainHandle {
                id: 7,
                name: "instance-7".to_string(),
            },
            base: descriptor(),
            base_paths: BaseImagePaths::in_dir(Path::new("/cache"), "base"),
            tracker: OverlayTracker::default(),
        })
    }

    fn synthesized() -> VmSession {
        VmSession::Synthesized(SynthesizedSession {
            domain: None,
            base: descriptor(),
            tracker: OverlayTracker::default(),
        })
    }

    #[tokio::test]
    async fn test_take_then_peek_is_not_found() {
        let registry = SessionRegistry::new();
        let vm = VmId::new();
        registry.register(vm, resumed()).await.unwrap();

        let taken = registry.take(&vm).await.unwrap();
        assert_eq!(taken.kind(), SessionKind::ResumedBase);
        assert_eq!(registry.peek(&vm).await.unwrap_err(), SessionError::NotFound(vm));
        assert_eq!(registry.take(&vm).await.unwrap_err(), SessionError::NotFound(vm));
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let registry = SessionRegistry::new();
        let vm = VmId::new();
        registry.register(vm, resumed()).await.unwrap();

        let err = registry.register(vm, synthesized()).await.unwrap_err();
        assert_eq!(err, SessionError::Duplicate(vm));
        assert_eq!(registry.peek(&vm).await.unwrap().kind(), SessionKind::ResumedBase);
    }

    #[tokio::test]
    async fn test_take_resumed_leaves_other_variant() {
        let registry = SessionRegistry::new();
        let vm = VmId::new();
        registry.register(vm, synthesized()).await.unwrap();

        let err = registry.take_resumed(&vm).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::WrongKind {
                actual: SessionKind::Synthesized,
                ..
            }
        ));
        assert!(registry.contains(&vm).await);

        registry.take_synthesized(&vm).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_take_has_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let vm = VmId::new();
        registry.register(vm, resumed()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.take(&vm).await.is_ok() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_restore_keeps_session_of_live_vm() {
        let registry = SessionRegistry::new();
        let host = MockHost::new();
        let vm = VmId::new();
        host.add_running(vm).await;

        registry.restore(vm, resumed(), &host).await;
        assert_eq!(registry.peek(&vm).await.unwrap().kind(), SessionKind::ResumedBase);
        assert!(host.terminated().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_releases_session_of_destroyed_vm() {
        let registry = SessionRegistry::new();
        let host = MockHost::new();
        let vm = VmId::new();
        host.add_running(vm).await;
        host.destroy_domain(&vm).await.unwrap();

        registry.restore(vm, synthesized(), &host).await;
        assert!(!registry.contains(&vm).await);
        assert_eq!(host.terminated().await.len(), 1);
    }
}
