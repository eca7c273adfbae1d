//! Upgrade registry: multi-provider aggregation with priority-based conflict
//! resolution, and the state machine that owns every upgrade's lifecycle.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod registry;
pub mod state_machine;

pub use registry::{
    Prioritized, RegistryError, SyncInfo, UpdateOutcome, UpgradeRegistry, resolve_priorities,
};
pub use state_machine::{StateMachine, StateMachineError, StateStorage};

#[cfg(test)]
mod tests;
