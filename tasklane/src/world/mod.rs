//! Per-frame scheduling of world update functions.
//!
//! Modules register update functions for one of the [`UpdatePhase`]s. Every
//! update turns each phase into a task group, chained so that a phase only
//! starts once the previous one has finished.

mod update;
pub use update::{UpdateContext, UpdateFn, UpdateFunctionDesc, UpdatePhase};

#[allow(clippy::module_inception)]
mod world;
pub use world::{ModuleId, World, WorldModule};
