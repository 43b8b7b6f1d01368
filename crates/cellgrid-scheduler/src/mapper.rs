//! Projection of a virtual placement onto concrete physical cells.
//!
//! Each virtual GPU leaf resolves through its preassigned (quota unit)
//! ancestor: an existing binding is reused, otherwise a free physical
//! cell of the same level is chosen and temporarily pre-bound for the
//! rest of the pass. Within the quota unit the mapper descends by
//! mirroring the virtual leaf's child-index path, which keeps the
//! mapping deterministic and position-preserving.
//!
//! Running into cells held by lower-priority owners triggers recovery
//! on the spot: lazy-preemption for groups that opted in, cancellation
//! for out-raced preemptors. Anything held at equal or higher priority
//! fails the mapping, and the scheduling attempt moves on.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use cellgrid_topology::{CellRef, PhysicalCellId, Priority, VirtualCellId};
use cellgrid_types::{CellHealthiness, CellState};

use crate::scheduler::{Scheduler, SchedulingRequest};

/// Scratch state of one mapping pass.
struct MapContext {
    /// Quota unit -> physical cell pinned for this pass. Pinning keeps
    /// all leaves of one unit on one physical cell even when bindings
    /// change mid-pass (lazy preemption releases them).
    pac_physical: HashMap<VirtualCellId, PhysicalCellId>,
    /// Temporary pre-bindings to clear when the pass ends.
    pre_bound: Vec<(PhysicalCellId, VirtualCellId)>,
    /// Physical quota units chosen so far, for co-location scoring.
    chosen: Vec<PhysicalCellId>,
}

impl Scheduler {
    /// Map a virtual placement to physical cells, or fail the attempt.
    /// Preemption decisions taken along the way (lazy preemptions,
    /// preemptor cancellations) persist even when the mapping fails.
    pub(crate) fn map_virtual_placement_to_physical(
        &mut self,
        virtual_placement: &BTreeMap<u32, Vec<Vec<VirtualCellId>>>,
        sr: &SchedulingRequest,
        suggested: &BTreeSet<String>,
    ) -> Option<BTreeMap<u32, Vec<Vec<PhysicalCellId>>>> {
        let mut ctx = MapContext {
            pac_physical: HashMap::new(),
            pre_bound: Vec::new(),
            chosen: Vec::new(),
        };
        let mut physical = BTreeMap::new();
        let mut failed = false;
        'mapping: for (&gpus, pods) in virtual_placement {
            let mut pod_cells = Vec::with_capacity(pods.len());
            for pod in pods {
                let mut cells = Vec::with_capacity(pod.len());
                for &v in pod {
                    match self.map_single_leaf(v, sr, suggested, &mut ctx) {
                        Some(p) => cells.push(p),
                        None => {
                            failed = true;
                            break 'mapping;
                        }
                    }
                }
                pod_cells.push(cells);
            }
            physical.insert(gpus, pod_cells);
        }

        // Pre-bindings are search state, never results.
        for (p, v) in ctx.pre_bound.drain(..) {
            self.forest.clear_pre_binding(p, v);
        }
        if failed {
            debug!(group = %sr.group_name, chain = %sr.chain, "virtual placement could not be mapped");
            return None;
        }
        Some(physical)
    }

    fn map_single_leaf(
        &mut self,
        v: VirtualCellId,
        sr: &SchedulingRequest,
        suggested: &BTreeSet<String>,
        ctx: &mut MapContext,
    ) -> Option<PhysicalCellId> {
        // An existing binding means a group of this VC holds (or is
        // acquiring) the cell; deal with that group first.
        loop {
            let Some(p) = self.forest.virt(v).physical_cell else {
                break;
            };
            match self.forest.phys(p).state {
                CellState::Used => {
                    let using = self
                        .forest
                        .phys(p)
                        .using_group
                        .clone()
                        .expect("Used cell has a using group");
                    let lazy = self
                        .allocated_groups
                        .get(&using)
                        .is_some_and(|g| g.lazy_preemption_enable);
                    if lazy {
                        self.lazy_preempt_affinity_group(&using, &sr.group_name);
                        continue;
                    }
                    return Some(p);
                }
                CellState::Acquiring | CellState::Acquired => {
                    let preemptor = self
                        .forest
                        .phys(p)
                        .acquiring_group
                        .clone()
                        .expect("acquiring cell has an acquiring group");
                    self.delete_preemptor_affinity_group(&preemptor, Some(&sr.group_name));
                    continue;
                }
                CellState::Free => return Some(p),
            }
        }

        let pac = self.forest.virt(v).preassigned;
        let pac_physical = match ctx.pac_physical.get(&pac) {
            Some(&p) => p,
            None => {
                let existing = self
                    .forest
                    .virt(pac)
                    .physical_cell
                    .or(self.forest.virt(pac).pre_bound_physical);
                let chosen = match existing {
                    Some(p) => p,
                    None => {
                        let Some(p) = self.select_preassigned_physical(pac, sr, suggested, ctx)
                        else {
                            panic!(
                                "VC safety broken: no physical cell available for preassigned cell {}",
                                self.forest.virt(pac).address
                            );
                        };
                        self.forest.pre_bind(p, pac);
                        ctx.pre_bound.push((p, pac));
                        p
                    }
                };
                ctx.pac_physical.insert(pac, chosen);
                ctx.chosen.push(chosen);
                chosen
            }
        };

        let leaf = self.mirror_descend(pac, pac_physical, v);
        self.resolve_leaf_conflict(leaf, sr)
    }

    /// Pick a free physical cell at the quota unit's level. Preference:
    /// all nodes suggested, healthy, co-located with cells already
    /// chosen for this group, least running work to disturb, stable
    /// address order.
    fn select_preassigned_physical(
        &self,
        pac: VirtualCellId,
        sr: &SchedulingRequest,
        suggested: &BTreeSet<String>,
        ctx: &MapContext,
    ) -> Option<PhysicalCellId> {
        let level = self.forest.virt(pac).level;
        let chain = self.forest.chain(&sr.chain);
        chain.full_list[level as usize - 1]
            .iter()
            .copied()
            .filter(|&c| self.in_free_candidate_path(c) && !self.subtree_has_binding(c))
            .min_by_key(|&c| {
                let cell = self.forest.phys(c);
                let suggested_miss =
                    u8::from(!cell.nodes.iter().all(|n| suggested.contains(n)));
                let unhealthy = u8::from(cell.healthiness == CellHealthiness::Bad);
                let colocation =
                    std::cmp::Reverse(self.max_shared_ancestor_depth(c, &ctx.chosen));
                let disruption = self
                    .forest
                    .used_at_or_above(CellRef::Phys(c), Priority::OPPORTUNISTIC)
                    .saturating_sub(self.forest.used_at_or_above(CellRef::Phys(c), sr.priority));
                (
                    suggested_miss,
                    unhealthy,
                    colocation,
                    disruption,
                    cell.address.clone(),
                )
            })
    }

    /// Whether any descendant of the cell carries a binding or a
    /// pre-binding (the cell then overlaps an already committed area).
    fn subtree_has_binding(&self, c: PhysicalCellId) -> bool {
        let cell = self.forest.phys(c);
        for &child in &cell.children {
            let grand = self.forest.phys(child);
            if grand.virtual_cell.is_some() || grand.pre_bound_virtual.is_some() {
                return true;
            }
            if self.subtree_has_binding(child) {
                return true;
            }
        }
        false
    }

    fn max_shared_ancestor_depth(&self, c: PhysicalCellId, chosen: &[PhysicalCellId]) -> u32 {
        chosen
            .iter()
            .map(|&other| self.shared_ancestor_depth(c, other))
            .max()
            .unwrap_or(0)
    }

    /// Depth of the deepest common ancestor of two cells; 0 when they
    /// share none. Bigger means closer together.
    fn shared_ancestor_depth(&self, a: PhysicalCellId, b: PhysicalCellId) -> u32 {
        let top = self.forest.chain(&self.forest.phys(a).chain).top_level();
        let mut ancestors = std::collections::HashSet::new();
        let mut cur = Some(a);
        while let Some(x) = cur {
            ancestors.insert(x);
            cur = self.forest.phys(x).parent;
        }
        let mut cur = Some(b);
        while let Some(x) = cur {
            if ancestors.contains(&x) {
                return top + 1 - self.forest.phys(x).level;
            }
            cur = self.forest.phys(x).parent;
        }
        0
    }

    /// Walk down the physical quota unit along the virtual leaf's
    /// child-index path.
    fn mirror_descend(
        &self,
        pac: VirtualCellId,
        pac_physical: PhysicalCellId,
        v: VirtualCellId,
    ) -> PhysicalCellId {
        let mut path = Vec::new();
        let mut cur = v;
        while cur != pac {
            let parent = self
                .forest
                .virt(cur)
                .parent
                .expect("the preassigned cell is an ancestor of its leaves");
            let index = self
                .forest
                .virt(parent)
                .children
                .iter()
                .position(|&c| c == cur)
                .expect("child links are consistent");
            path.push(index);
            cur = parent;
        }
        let mut physical = pac_physical;
        for &index in path.iter().rev() {
            physical = self.forest.phys(physical).children[index];
        }
        physical
    }

    /// Decide what to do about the current occupant of a mapped leaf.
    /// `None` means the leaf cannot be taken at this priority.
    fn resolve_leaf_conflict(
        &mut self,
        p: PhysicalCellId,
        sr: &SchedulingRequest,
    ) -> Option<PhysicalCellId> {
        loop {
            match self.forest.phys(p).state {
                CellState::Free => return Some(p),
                CellState::Used => {
                    let using = self
                        .forest
                        .phys(p)
                        .using_group
                        .clone()
                        .expect("Used cell has a using group");
                    let Some(group) = self.allocated_groups.get(&using) else {
                        return Some(p);
                    };
                    if Priority::from_request(group.priority) >= sr.priority {
                        return None;
                    }
                    if group.lazy_preemption_enable && self.forest.phys(p).virtual_cell.is_some() {
                        self.lazy_preempt_affinity_group(&using, &sr.group_name);
                        continue;
                    }
                    return Some(p);
                }
                CellState::Acquiring | CellState::Acquired => {
                    let preemptor = self
                        .forest
                        .phys(p)
                        .acquiring_group
                        .clone()
                        .expect("acquiring cell has an acquiring group");
                    let Some(group) = self.preemptor_groups.get(&preemptor) else {
                        return None;
                    };
                    if Priority::from_request(group.priority) >= sr.priority {
                        return None;
                    }
                    self.delete_preemptor_affinity_group(&preemptor, Some(&sr.group_name));
                    continue;
                }
            }
        }
    }
}
