//! cellgrid-types — shared domain types for the cellgrid scheduler.
//!
//! These types form the external contract of the scheduling engine:
//!
//! - [`config`] — the static cluster description ingested once at
//!   construction (cell chains, physical roots, virtual clusters)
//! - [`spec`] — per-call inputs and outputs (scheduling specs, bind
//!   info, schedule results)
//! - [`status`] — read-only snapshots exposed to API consumers
//!
//! All types are serializable so the host daemon can move them over
//! whatever wire it likes; the engine itself never performs I/O.

pub mod config;
pub mod spec;
pub mod status;

pub use config::{
    ChainSpec, ConfigError, LevelSpec, ReservationSpec, RootCellSpec, SchedulerConfig,
    VcCellQuota, VirtualClusterSpec,
};
pub use spec::{
    AffinityGroupMember, AffinityGroupSpec, MemberBindInfo, PodBindInfo, PodPlacementInfo,
    PodScheduleResult, PodSchedulingSpec,
};
pub use status::{
    AffinityGroupState, AffinityGroupStatus, CellHealthiness, CellState, ClusterStatus,
    LazyPreemptionStatus, PhysicalCellStatus, VirtualCellStatus,
};

/// Unique name of a virtual cluster (tenant).
pub type VirtualClusterName = String;

/// Name of a cell chain (one hardware class, e.g. one GPU model).
pub type CellChainName = String;

/// Level within a chain. GPU leaves are level 1; the chain root is the
/// highest level.
pub type CellLevel = u32;

/// Opaque pod identity assigned by the host (e.g. `namespace/name`).
pub type PodKey = String;
