//! cellgrid-scheduler — the placement and preemption engine.
//!
//! The engine decides, in one atomic step per request, whether an
//! affinity group can be admitted, which physical GPUs it gets, which
//! virtual-cluster quota cells are charged, and which lower-priority
//! groups must be preempted to make room.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (single-writer facade)
//!   ├── CellForest (physical + virtual cell graph)
//!   ├── FreeList per chain (buddy split on take, merge on release)
//!   ├── Five counters per chain/level (totalLeft, vcFree, allVCFree,
//!   │   badFree, doomedBad), always updated together
//!   ├── packer (topology-aware search, shared by all scheduling modes)
//!   ├── mapper (virtual placement -> physical placement)
//!   ├── health accountant (bad nodes, doomed-bad virtual cells)
//!   └── affinity groups (Allocated / Preempting / BeingPreempted)
//! ```
//!
//! All mutating entry points take `&mut self`; wrap the engine in
//! [`SharedScheduler`] to get the read/write-lock discipline described
//! by the concurrency model (every mutation behind the write side,
//! status queries behind the read side).

pub mod error;
pub mod group;
pub mod scheduler;
pub mod shared;

mod alloc;
mod health;
mod intra_vc;
mod invariants;
mod mapper;
mod packer;
mod result;
mod status;

pub use error::{SchedulerError, SchedulerResult};
pub use group::{AffinityGroup, AllocatedPod};
pub use scheduler::Scheduler;
pub use shared::SharedScheduler;
