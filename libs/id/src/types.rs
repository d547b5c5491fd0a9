//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// A virtual machine managed on this host.
    VmId,
    "vm"
);

define_id!(
    /// One handoff attempt, used to correlate send/receive logs.
    HandoffId,
    "hof"
);
