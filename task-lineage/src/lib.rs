#![deny(missing_docs)]

//! This crate provides:
//! - A process-wide registry of task parent/child edges, recorded at spawn time.
//! - An ancestry query that reconstructs the chain of ancestor task ids for any task.
//!
//! The point of the registry is to let library code discover *which logical
//! request it is running on behalf of* without threading a context argument
//! through every call site. A task arbitrarily deep in a spawn chain can ask
//! for its ancestors and match them against some table keyed by task id.
//!
//! Task ids are process-unique `u64` values assigned lazily, one per OS
//! thread. Host runtimes with native task ids can bypass the built-in
//! assignment entirely and feed their own ids through
//! [`SpawnRegistry::record_spawn`].
//!
//! ```
//! use task_lineage::{current_task_id, registry, spawn};
//!
//! let parent = current_task_id();
//! spawn(move || {
//!     let chain = registry().ancestors(current_task_id(), 10);
//!     assert_eq!(chain[1], parent);
//! })
//! .join()
//! .unwrap();
//! ```
//!
//! There is no notification when a task terminates, so the registry cannot
//! eagerly reclaim edges. Instead it relies on two mechanisms: a newer record
//! for the same child id marks older duplicates dead during lookup, and a
//! background sweep (piggybacked on `record_spawn`, rate-limited, one shard
//! at a time) removes dead and expired records. Losing an edge only degrades
//! an ancestry walk to a shorter chain; it never corrupts one.

mod registry;
mod task;

pub use crate::registry::{registry, SpawnRegistry};
pub use crate::task::{current_task_id, spawn};
