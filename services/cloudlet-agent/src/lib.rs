//! Cloudlet Agent Library
//!
//! The cloudlet agent runs on each compute host and lets VMs be built from
//! shared base images. A VM is either resumed from a cached base, synthesized
//! from a base plus an overlay, or received live from another host.
//!
//! ## Architecture
//!
//! ```text
//! CloudletService
//! ├── BaseImageCache              (content-addressed, deduped artifact fetches)
//! ├── SessionRegistry             (VmId -> live session)
//! ├── BaseImageCreator            (running VM -> four base artifacts)
//! ├── OverlaySynthesisController  (resumed base -> uploaded overlay)
//! ├── HandoffEngine               (drives the external transfer worker)
//! └── DestinationClient           (finds a receiver on a remote deployment)
//! ```
//!
//! Hypervisor access goes through [`HypervisorSessionHost`]; [`MockHost`] and
//! [`MemoryCatalog`] stand in for the hypervisor and image catalog in tests.
//!
//! ## Modules
//!
//! - `image`: base descriptors and the local artifact cache
//! - `session`: live sessions and their registry
//! - `handoff`: send/receive state machines around the transfer worker
//! - `negotiate`: destination resolution for cross-deployment handoffs
//! - `tunnel`: single-use TCP port forwarding

pub mod base;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handoff;
pub mod image;
pub mod negotiate;
pub mod poll;
pub mod runtime;
pub mod service;
pub mod session;
pub mod synthesis;
pub mod tunnel;

// Re-export commonly used types
pub use catalog::{HttpCatalog, ImageCatalog, ImageRecord, MemoryCatalog};
pub use config::Config;
pub use error::CloudletError;
pub use runtime::{HypervisorSessionHost, MockHost};
pub use service::{
    CloudletService, HandoffOptions, HandoffReport, NegotiationParams, SpawnMetadata,
    SpawnOutcome,
};
pub use synthesis::OverlayArtifact;
