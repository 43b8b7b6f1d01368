//! Scheduling within one virtual cluster.
//!
//! A guaranteed request searches the tenant's own virtual cells: the
//! preassigned quota units of the requested chain, or a single reserved
//! tree when the request carries a reservation id. Cells occupied at
//! lower priorities count as available, which is what makes intra-VC
//! preemption fall out of the same search.

use std::collections::BTreeMap;

use tracing::debug;

use cellgrid_topology::{CellForest, CellRef, VcCellSet, VirtualCellId};

use crate::packer::{self, PackRequest};
use crate::scheduler::SchedulingRequest;

/// Produce a virtual placement for the request, or nothing when the
/// tenant's cells cannot hold the group.
pub(crate) fn schedule_within_vc(
    forest: &CellForest,
    set: &VcCellSet,
    sr: &SchedulingRequest,
) -> Option<BTreeMap<u32, Vec<Vec<VirtualCellId>>>> {
    let roots: Vec<CellRef> = match &sr.reservation_id {
        Some(rid) => {
            let &(vroot, _) = set.reserved.get(rid)?;
            vec![CellRef::Virt(vroot)]
        }
        None => set
            .preassigned_roots(&sr.chain)
            .into_iter()
            .map(CellRef::Virt)
            .collect(),
    };
    if roots.is_empty() {
        debug!(vc = %sr.vc, chain = %sr.chain, "tenant has no cells in this chain");
        return None;
    }

    let request = PackRequest {
        priority: sr.priority,
        pod_gpu_counts: &sr.pod_gpu_counts,
        suggested_nodes: None,
    };
    let placement = packer::place_group(forest, &sr.chain, &roots, &request, &|_| 0)?;
    Some(
        placement
            .into_iter()
            .map(|(gpus, pods)| {
                (
                    gpus,
                    pods.into_iter()
                        .map(|leaves| {
                            leaves
                                .into_iter()
                                .map(|c| match c {
                                    CellRef::Virt(id) => id,
                                    CellRef::Phys(_) => unreachable!("virtual search"),
                                })
                                .collect()
                        })
                        .collect(),
                )
            })
            .collect(),
    )
}
