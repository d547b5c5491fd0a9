//! Shared setup for the cloudlet agent integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cloudlet_agent::image::BaseImageDescriptor;
use cloudlet_agent::{CloudletService, Config, ImageCatalog, ImageRecord, MemoryCatalog, MockHost};
use cloudlet_id::VmId;

/// One compute host: its own data directory, hypervisor and service.
pub struct Host {
    pub dir: TempDir,
    pub hypervisor: Arc<MockHost>,
    pub catalog: Arc<MemoryCatalog>,
    pub service: CloudletService,
}

impl Host {
    /// A host sharing `catalog` with any other host built from it.
    pub async fn new(catalog: Arc<MemoryCatalog>) -> Self {
        Self::with_config(catalog, |_, _| {}).await
    }

    /// `tweak` sees the data directory, so it can place worker scripts there.
    pub async fn with_config(
        catalog: Arc<MemoryCatalog>,
        tweak: impl FnOnce(&Path, &mut Config),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let hypervisor = Arc::new(MockHost::new());

        let mut config = Config::with_data_dir(dir.path());
        config.poll_interval = Duration::from_millis(10);
        config.boot_timeout = Duration::from_secs(5);
        config.send_worker = dir.path().join("missing-send-worker");
        config.recv_worker = dir.path().join("missing-recv-worker");
        tweak(dir.path(), &mut config);

        let service = CloudletService::new(config, hypervisor.clone(), catalog.clone()).unwrap();
        service.init().await.unwrap();

        Self {
            dir,
            hypervisor,
            catalog,
            service,
        }
    }

    /// Number of handoff scratch directories left behind.
    pub fn handoff_scratch_dirs(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("handoff"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Write an executable `/bin/sh` script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Create a base VM named `name` on `host` and return its descriptor and disk record.
pub async fn publish_base(host: &Host, name: &str) -> (BaseImageDescriptor, ImageRecord) {
    let source = VmId::new();
    host.hypervisor.add_running(source).await;
    let descriptor = host.service.create_base(&source, name).await.unwrap();
    let record = host.catalog.show(&descriptor.disk).await.unwrap();
    (descriptor, record)
}
