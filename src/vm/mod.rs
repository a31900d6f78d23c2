//! VM lifecycle management.
//!
//! This module provides the core abstractions for one instance:
//! - [`VirtualMachine`]: the power state machine owning specs and snapshot chain
//! - [`Hypervisor`]: trait for the native VM object of a backend
//! - [`GuestChannel`]: trait for messages shown inside the guest
//! - [`StatusMonitor`]: trait notified after every committed transition

pub mod backend;
pub mod guest;
pub mod machine;
pub mod shutdown;
pub mod specs;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
pub use backend::Hypervisor;
pub use guest::GuestChannel;
pub use machine::{VirtualMachine, VmBuilder};
pub use shutdown::ShutdownController;
pub use specs::{MemorySize, NetworkInterface, VmMount, VmSpecs};
pub use state::VmState;

/// Backing store and observer of instance status.
///
/// The `persist_*` methods are called before a change is applied in memory;
/// an error aborts the change. The `on_*` hooks run synchronously after the
/// change is committed.
///
/// Every method is called from async code with the instance lock held.
/// Implementations must return quickly and must not call back into the
/// instance.
pub trait StatusMonitor: Send + Sync {
    /// Persist a new power state.
    fn persist_state_for(&self, vm: &str, state: VmState) -> Result<()>;

    /// Persist new specs.
    fn persist_specs_for(&self, vm: &str, specs: &VmSpecs) -> Result<()>;

    /// Called after every committed state change.
    fn on_transition(&self, _vm: &str, _from: VmState, _to: VmState) {}

    /// Called once a suspend has completed.
    fn on_suspend(&self, _vm: &str) {}

    /// Called once a shutdown has completed.
    fn on_shutdown(&self, _vm: &str) {}

    /// Called once a restart has completed.
    fn on_restart(&self, _vm: &str) {}
}
