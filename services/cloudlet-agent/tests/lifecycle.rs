//! Integration tests for the base -> resume -> overlay -> synthesize lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cloudlet_agent::image::{ArtifactKind, CacheKey};
use cloudlet_agent::runtime::TaskState;
use cloudlet_agent::session::{SessionKind, VmSession};
use cloudlet_agent::{
    CloudletError, HypervisorSessionHost, ImageCatalog, MemoryCatalog, SpawnMetadata,
    SpawnOutcome,
};
use cloudlet_id::{BaseHash, VmId};

use common::{publish_base, Host};

#[tokio::test]
async fn test_create_base_publishes_and_caches_artifacts() {
    let host = Host::new(Arc::new(MemoryCatalog::new())).await;
    let source = VmId::new();
    host.hypervisor.add_running(source).await;

    let descriptor = host.service.create_base(&source, "ubuntu").await.unwrap();

    let base_hash = BaseHash::for_instance(&source);
    assert_eq!(descriptor.base_hash, base_hash);
    for (kind, name) in [
        (ArtifactKind::Disk, "ubuntu-disk"),
        (ArtifactKind::Memory, "ubuntu-mem"),
        (ArtifactKind::DiskHashIndex, "ubuntu-disk-meta"),
        (ArtifactKind::MemoryHashIndex, "ubuntu-mem-meta"),
    ] {
        let record = host.catalog.show(descriptor.artifact_id(kind)).await.unwrap();
        assert_eq!(record.name, name);
        assert_eq!(record.property_str("base_sha256_uuid"), Some(base_hash.as_str()));
        assert!(
            host.service
                .cache()
                .contains(&CacheKey::for_artifact(&base_hash, kind))
                .await
        );
    }

    assert_eq!(host.hypervisor.extract_count().await, 1);
    let snapshots = host
        .hypervisor
        .task_history(&source)
        .await
        .into_iter()
        .filter(|state| *state == Some(TaskState::ImageSnapshot))
        .count();
    assert_eq!(snapshots, 1);
}

#[tokio::test]
async fn test_resume_finish_and_synthesize_elsewhere() {
    let catalog = Arc::new(MemoryCatalog::new());
    let origin = Host::new(catalog.clone()).await;
    let (descriptor, disk) = publish_base(&origin, "ubuntu").await;

    // Resume on the host that created the base: everything is already cached.
    let vm = VmId::new();
    let outcome = origin
        .service
        .spawn(&vm, &disk, &SpawnMetadata::default())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        SpawnOutcome::Launched {
            kind: SessionKind::ResumedBase,
            ..
        }
    ));
    assert_eq!(catalog.download_count(), 0);

    let overlay = origin.service.overlay_finish(&vm, "ubuntu-app").await.unwrap();
    assert_eq!(overlay.base_hash, descriptor.base_hash);
    assert!(!origin.service.sessions().contains(&vm).await);

    // A second host fetches the base from the catalog and synthesizes.
    let edge = Host::new(catalog.clone()).await;
    let overlay_url = format!("catalog://{}", overlay.image_id);
    edge.hypervisor
        .set_overlay_hash(&overlay_url, descriptor.base_hash.clone())
        .await;

    let synthesized = VmId::new();
    let metadata = SpawnMetadata {
        overlay_url: Some(overlay_url),
        ..Default::default()
    };
    let outcome = edge.service.spawn(&synthesized, &disk, &metadata).await.unwrap();
    assert!(matches!(
        outcome,
        SpawnOutcome::Launched {
            kind: SessionKind::Synthesized,
            ..
        }
    ));
    assert_eq!(catalog.download_count(), 4);

    edge.service.destroy(&synthesized).await.unwrap();
    let terminated = edge.hypervisor.terminated().await;
    assert_eq!(terminated.len(), 1);
    match &terminated[0] {
        VmSession::Synthesized(session) => assert!(session.domain.is_none()),
        other => panic!("unexpected session {:?}", other.kind()),
    }
    assert!(edge.service.sessions().is_empty().await);
}

#[tokio::test]
async fn test_overlay_for_other_base_is_rejected() {
    let catalog = Arc::new(MemoryCatalog::new());
    let host = Host::new(catalog).await;
    let (_, disk) = publish_base(&host, "ubuntu").await;

    let other = BaseHash::for_instance(&VmId::new());
    host.hypervisor.set_overlay_hash("catalog://foreign", other.clone()).await;

    let vm = VmId::new();
    let metadata = SpawnMetadata {
        overlay_url: Some("catalog://foreign".to_string()),
        ..Default::default()
    };
    let err = host.service.spawn(&vm, &disk, &metadata).await.unwrap_err();
    assert!(matches!(err, CloudletError::BaseHashMismatch { actual, .. } if actual == other));
    assert!(!host.service.sessions().contains(&vm).await);
    assert!(host.hypervisor.domain(&vm).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_spawns_share_one_download() {
    let catalog = Arc::new(MemoryCatalog::with_download_delay(Duration::from_millis(50)));
    let origin = Host::new(catalog.clone()).await;
    let (_, disk) = publish_base(&origin, "ubuntu").await;

    let edge = Host::new(catalog.clone()).await;
    let (a, b) = (VmId::new(), VmId::new());
    let metadata = SpawnMetadata::default();
    let (first, second) = tokio::join!(
        edge.service.spawn(&a, &disk, &metadata),
        edge.service.spawn(&b, &disk, &metadata),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(catalog.download_count(), 4);
    assert_eq!(edge.service.sessions().len().await, 2);
}

#[tokio::test]
async fn test_spawn_times_out_when_vm_never_runs() {
    let catalog = Arc::new(MemoryCatalog::new());
    let host = Host::with_config(catalog, |_, config| {
        config.boot_timeout = Duration::from_millis(100);
    })
    .await;
    let (_, disk) = publish_base(&host, "ubuntu").await;
    host.hypervisor.set_boot_polls(u32::MAX).await;

    let vm = VmId::new();
    let err = host
        .service
        .spawn(&vm, &disk, &SpawnMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CloudletError::BootTimeout { vm_id, .. } if vm_id == vm));

    // The session stays registered so destroy can release it.
    host.service.destroy(&vm).await.unwrap();
    assert_eq!(host.hypervisor.terminated().await.len(), 1);
}

#[tokio::test]
async fn test_second_spawn_of_same_vm_is_duplicate() {
    let catalog = Arc::new(MemoryCatalog::new());
    let host = Host::new(catalog).await;
    let (_, disk) = publish_base(&host, "ubuntu").await;

    let vm = VmId::new();
    host.service
        .spawn(&vm, &disk, &SpawnMetadata::default())
        .await
        .unwrap();
    let err = host
        .service
        .spawn(&vm, &disk, &SpawnMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CloudletError::DuplicateSession(id) if id == vm));
}
