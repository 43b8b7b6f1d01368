//! cellgrid-topology — the cell graph of the cellgrid scheduler.
//!
//! A cluster is a forest of chains. Each chain is a tree of cells with
//! GPU leaves at level 1 and the chain root at the top. Cells come in
//! two variants: physical cells describe the real hardware, virtual
//! cells describe a tenant's quota. The two sides are connected by a
//! symmetric, optional binding.
//!
//! Cells live in index-based arenas inside a [`CellForest`]; every
//! reference between cells (parent, child, binding) is a typed index.
//! The forest owns the invariant-carrying mutations: binding, priority
//! propagation, usage histograms, and healthiness. Callers hold the
//! forest exclusively while scheduling, so none of this is
//! concurrency-safe on its own.

pub mod cell;
pub mod forest;
pub mod free_list;

pub use cell::{CellRef, PhysicalCell, PhysicalCellId, Priority, VirtualCell, VirtualCellId};
pub use forest::{CellForest, ChainInfo, LevelInfo, VcCellSet};
pub use free_list::FreeList;
