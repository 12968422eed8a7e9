/// Native module contains OS-backed implementations of core traits,
/// talking to the process table and procfs directly.
mod group;

pub mod memory;
pub mod runner;

pub(crate) use group::ProcessGroup;
