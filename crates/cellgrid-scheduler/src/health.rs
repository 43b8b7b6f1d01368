//! Health accounting: bad-node propagation and doomed-bad virtual
//! cells.
//!
//! Node health toggles walk the GPU leaves on the node and propagate
//! toward the chain root: a parent goes bad when all its children are
//! bad and recovers as soon as one child does. Every toggle that
//! affects an obtainable cell moves `badFree`, and each `badFree` move
//! re-derives how many of each VC's free quota units are doomed to be
//! bad, marking or unmarking unbound virtual cells deterministically.

use tracing::{debug, info, warn};

use cellgrid_topology::{PhysicalCellId, VirtualCellId};
use cellgrid_types::CellHealthiness;

use crate::scheduler::Scheduler;

impl Scheduler {
    pub(crate) fn set_bad_node(&mut self, node: &str) {
        if !self.bad_nodes.insert(node.to_string()) {
            return;
        }
        info!(node, "marking node and its cells bad");
        for leaf in self.leaves_on_node(node) {
            self.set_bad_cell(leaf);
        }
    }

    pub(crate) fn set_healthy_node(&mut self, node: &str) {
        if !self.bad_nodes.remove(node) {
            return;
        }
        info!(node, "marking node and its cells healthy");
        for leaf in self.leaves_on_node(node) {
            self.set_healthy_cell(leaf);
        }
    }

    fn leaves_on_node(&self, node: &str) -> Vec<PhysicalCellId> {
        let mut leaves = Vec::new();
        for chain in self.forest.chains() {
            for &leaf in &chain.full_list[0] {
                if self.forest.phys(leaf).nodes[0] == node {
                    leaves.push(leaf);
                }
            }
        }
        leaves
    }

    /// Mark a cell (and its bound virtual counterpart) bad, recursing
    /// to the parent once all of its children are bad.
    fn set_bad_cell(&mut self, c: PhysicalCellId) {
        self.forest.set_phys_healthiness(c, CellHealthiness::Bad);
        if self.in_free_candidate_path(c) {
            let (chain, level) = {
                let cell = self.forest.phys(c);
                (cell.chain.clone(), cell.level)
            };
            self.increment_bad_free(&chain, level, 1);
        }
        if let Some(parent) = self.forest.phys(c).parent {
            let all_bad = self
                .forest
                .phys(parent)
                .children
                .iter()
                .all(|&b| self.forest.phys(b).healthiness == CellHealthiness::Bad);
            if all_bad {
                self.set_bad_cell(parent);
            }
        }
    }

    /// Mark a cell (and its bound virtual counterpart) healthy,
    /// recursing to the parent while it is still marked bad.
    fn set_healthy_cell(&mut self, c: PhysicalCellId) {
        self.forest.set_phys_healthiness(c, CellHealthiness::Healthy);
        if self.in_free_candidate_path(c) {
            let (chain, level) = {
                let cell = self.forest.phys(c);
                (cell.chain.clone(), cell.level)
            };
            self.decrement_bad_free(&chain, level, 1);
        }
        if let Some(parent) = self.forest.phys(c).parent {
            if self.forest.phys(parent).healthiness == CellHealthiness::Bad {
                self.set_healthy_cell(parent);
            }
        }
    }

    /// Raise `badFree` and re-derive doomed cells. Warns when healthy
    /// capacity no longer covers the VCs' free quota.
    pub(crate) fn increment_bad_free(&mut self, chain: &str, level: u32, n: i32) {
        *self.bad_free_mut(chain, level) += n;
        let healthy_left = self.total_left_at(chain, level) - self.bad_free_at(chain, level);
        if self.all_vc_free_at(chain, level) > healthy_left {
            warn!(
                chain,
                level,
                healthy_left,
                bad = self.bad_free_at(chain, level),
                vc_free = self.all_vc_free_at(chain, level),
                "fewer healthy cells than the total free cells of all VCs, \
                 some VC cells may be doomed to be bad"
            );
        }
        self.check_vc_doomed_bad(chain, level);
    }

    /// Lower `badFree` and re-derive doomed cells.
    pub(crate) fn decrement_bad_free(&mut self, chain: &str, level: u32, n: i32) {
        *self.bad_free_mut(chain, level) -= n;
        let healthy_left = self.total_left_at(chain, level) - self.bad_free_at(chain, level);
        if self.all_vc_free_at(chain, level) == healthy_left {
            info!(
                chain,
                level,
                healthy_left,
                "healthy cells again cover the total free cells of all VCs"
            );
        }
        self.check_vc_doomed_bad(chain, level);
    }

    /// Recompute `doomedBad` for every VC with quota at (chain, level)
    /// and adjust the marking of its unbound virtual cells by the
    /// delta, in free-list (construction) order.
    pub(crate) fn check_vc_doomed_bad(&mut self, chain: &str, level: u32) {
        let vcs: Vec<String> = self
            .vc_free
            .keys()
            .filter(|(_, c, l)| c == chain && *l == level)
            .map(|(vc, _, _)| vc.clone())
            .collect();
        for vc in vcs {
            let prev = self.doomed_at(&vc, chain, level);
            let vc_free = self.vc_free_at(&vc, chain, level);
            let healthy_left = self.total_left_at(chain, level) - self.bad_free_at(chain, level);
            let next = (vc_free - healthy_left).max(0);
            self.vc_doomed_bad
                .insert((vc.clone(), chain.to_string(), level), next);
            if next > prev {
                warn!(
                    vc = %vc,
                    chain,
                    level,
                    doomed = next,
                    "VC has fewer healthy cells than its free cells, \
                     some of its cells are doomed to be bad"
                );
                self.mark_doomed_cells(&vc, chain, level, (next - prev) as u32, true);
            } else if next < prev {
                debug!(vc = %vc, chain, level, doomed = next, "doomed cells recovering");
                self.mark_doomed_cells(&vc, chain, level, (prev - next) as u32, false);
            }
        }
    }

    /// Flip the API healthiness of up to `count` unbound quota units.
    /// Reserved cells never appear here; their binding is static.
    fn mark_doomed_cells(&mut self, vc: &str, chain: &str, level: u32, count: u32, bad: bool) {
        let cells: Vec<VirtualCellId> = self.vc_sets[vc].preassigned_at(chain, level).to_vec();
        let mut flipped = 0;
        for v in cells {
            if flipped >= count {
                break;
            }
            let cell = self.forest.virt(v);
            if cell.physical_cell.is_some() {
                continue;
            }
            let is_bad = cell.healthiness == CellHealthiness::Bad;
            if bad && !is_bad {
                self.forest.virt_mut(v).healthiness = CellHealthiness::Bad;
                flipped += 1;
            } else if !bad && is_bad {
                self.forest.virt_mut(v).healthiness = CellHealthiness::Healthy;
                flipped += 1;
            }
        }
    }
}
