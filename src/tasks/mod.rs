//! Background Tasks Module
//!
//! Tasks that run detached from the callers of a cache engine.
//!
//! # Tasks
//! - Expiry sweep: removes expired entries at the configured interval
//! - Mirror worker: applies fire-and-forget writes to the persistence backend

mod mirror;
mod sweep;

pub use mirror::{spawn_mirror_worker, MirrorHandle, MirrorOp};
pub use sweep::spawn_sweep_task;
