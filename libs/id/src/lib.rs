//! # cloudlet-id
//!
//! Identifier types shared by the cloudlet services.
//!
//! ## ID Format
//!
//! Resource IDs use a prefixed format: `{prefix}_{ulid}`.
//!
//! - `vm_01HV4Z2WQXKJNM8GPQY6VBKC3D` identifies a virtual machine
//! - `hof_01HV4Z3MXNKPQR9HSTZ7WCLD4E` identifies one handoff attempt
//!
//! Content hashes ([`BaseHash`]) are plain lowercase sha256 hex strings. A
//! base VM's hash is derived from the identity of the instance it was
//! captured from, so every artifact of one base VM carries the same value.

mod error;
mod hash;
mod macros;
mod types;

pub use error::IdError;
pub use hash::BaseHash;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
