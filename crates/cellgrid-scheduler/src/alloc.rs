//! Cell allocation and release over the free list.
//!
//! Taking a cell below a chain root splits its unsplit ancestors into
//! the free list on the way up; releasing merges buddies back once the
//! whole sibling set is free again. The five counters (`totalLeft`,
//! `vcFree`, `allVCFree`, `badFree`, `doomedBad`) move inside the same
//! call as the structural change.

use tracing::warn;

use cellgrid_topology::{CellRef, PhysicalCellId, Priority, VirtualCellId};
use cellgrid_types::CellHealthiness;

use crate::scheduler::Scheduler;

impl Scheduler {
    // ── Counter access ──────────────────────────────────────────────

    pub(crate) fn total_left_at(&self, chain: &str, level: u32) -> i32 {
        self.total_left
            .get(&(chain.to_string(), level))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_left_mut(&mut self, chain: &str, level: u32) -> &mut i32 {
        self.total_left.entry((chain.to_string(), level)).or_insert(0)
    }

    pub(crate) fn all_vc_free_at(&self, chain: &str, level: u32) -> i32 {
        self.all_vc_free
            .get(&(chain.to_string(), level))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn all_vc_free_mut(&mut self, chain: &str, level: u32) -> &mut i32 {
        self.all_vc_free.entry((chain.to_string(), level)).or_insert(0)
    }

    pub(crate) fn bad_free_at(&self, chain: &str, level: u32) -> i32 {
        self.bad_free
            .get(&(chain.to_string(), level))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn bad_free_mut(&mut self, chain: &str, level: u32) -> &mut i32 {
        self.bad_free.entry((chain.to_string(), level)).or_insert(0)
    }

    pub(crate) fn vc_free_at(&self, vc: &str, chain: &str, level: u32) -> i32 {
        self.vc_free
            .get(&(vc.to_string(), chain.to_string(), level))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn vc_free_mut(&mut self, vc: &str, chain: &str, level: u32) -> &mut i32 {
        self.vc_free
            .entry((vc.to_string(), chain.to_string(), level))
            .or_insert(0)
    }

    pub(crate) fn doomed_at(&self, vc: &str, chain: &str, level: u32) -> i32 {
        self.vc_doomed_bad
            .get(&(vc.to_string(), chain.to_string(), level))
            .copied()
            .unwrap_or(0)
    }

    // ── Leaf allocation ─────────────────────────────────────────────

    /// Charge a GPU leaf to a group: set priorities and usage, create
    /// the virtual binding (charging VC quota when the quota unit is
    /// newly bound), or tag the cell as an opportunistic borrowing.
    ///
    /// Returns `false` with a message when the allocation violated
    /// safety; the allocation still completes.
    pub(crate) fn allocate_leaf(
        &mut self,
        p: PhysicalCellId,
        v: Option<VirtualCellId>,
        priority: Priority,
        vc: &str,
    ) -> (bool, Option<String>) {
        let mut success = true;
        let mut message = None;
        match v {
            Some(v) => {
                self.forest.set_priority(CellRef::Virt(v), priority);
                self.forest.update_used_leaves(CellRef::Virt(v), priority, 1);
                self.forest.set_priority(CellRef::Phys(p), priority);
                self.forest.update_used_leaves(CellRef::Phys(p), priority, 1);

                let pac = self.forest.virt(v).preassigned;
                let newly_bound = self.forest.virt(pac).physical_cell.is_none();
                let pac_bad = self.forest.virt(pac).healthiness == CellHealthiness::Bad;
                self.forest.bind(p, v);
                if newly_bound {
                    let (chain, level) = {
                        let cell = self.forest.virt(pac);
                        (cell.chain.clone(), cell.level)
                    };
                    *self.vc_free_mut(vc, &chain, level) -= 1;
                    *self.all_vc_free_mut(&chain, level) -= 1;
                    if pac_bad {
                        // The quota unit was counted as doomed; it is
                        // no longer free so it stops counting.
                        *self
                            .vc_doomed_bad
                            .entry((vc.to_string(), chain.clone(), level))
                            .or_insert(0) -= 1;
                    }
                    let pac_physical = self
                        .forest
                        .virt(pac)
                        .physical_cell
                        .expect("bind set the preassigned binding");
                    (success, message) = self.remove_cell_from_free_list(pac_physical);
                }
            }
            None => {
                self.forest.set_priority(CellRef::Phys(p), Priority::OPPORTUNISTIC);
                self.forest
                    .update_used_leaves(CellRef::Phys(p), Priority::OPPORTUNISTIC, 1);
                self.forest.phys_mut(p).oppor_vc = Some(vc.to_string());
            }
        }
        (success, message)
    }

    /// Inverse of [`allocate_leaf`]: destroy the binding (releasing VC
    /// quota when the quota unit becomes fully unbound) and reset
    /// priorities and usage.
    pub(crate) fn release_leaf(&mut self, p: PhysicalCellId, vc: &str) {
        if let Some(v) = self.forest.phys(p).virtual_cell {
            let pac = self.forest.virt(v).preassigned;
            let pac_physical = self.forest.virt(pac).physical_cell;
            self.forest.unbind(p);
            if self.forest.virt(pac).physical_cell.is_none() {
                let (chain, level) = {
                    let cell = self.forest.virt(pac);
                    (cell.chain.clone(), cell.level)
                };
                *self.vc_free_mut(vc, &chain, level) += 1;
                *self.all_vc_free_mut(&chain, level) += 1;
                if let Some(pac_physical) = pac_physical {
                    self.add_cell_to_free_list(pac_physical);
                }
            }
            let priority = self.forest.virt(v).priority;
            self.forest.update_used_leaves(CellRef::Virt(v), priority, -1);
            self.forest.set_priority(CellRef::Virt(v), Priority::FREE);
        } else {
            self.forest.phys_mut(p).oppor_vc = None;
        }
        let priority = self.forest.phys(p).priority;
        self.forest.update_used_leaves(CellRef::Phys(p), priority, -1);
        self.forest.set_priority(CellRef::Phys(p), Priority::FREE);
    }

    // ── Free list structure ─────────────────────────────────────────

    /// Remove a cell from the free list, splitting unsplit ancestors on
    /// the way up. Reports a safety violation when any level is left
    /// with fewer cells than the VCs' free quota.
    pub(crate) fn remove_cell_from_free_list(
        &mut self,
        c: PhysicalCellId,
    ) -> (bool, Option<String>) {
        let (chain, level) = {
            let cell = self.forest.phys(c);
            (cell.chain.clone(), cell.level)
        };
        let fanouts: Vec<i32> = {
            let info = self.forest.chain(&chain);
            (1..=info.top_level()).map(|l| info.fanout(l) as i32).collect()
        };
        let mut success = true;
        let mut message = None;

        // Descendants of the removed cell stop being obtainable.
        let mut num = fanouts[level as usize - 1];
        for l in (1..level).rev() {
            *self.total_left_mut(&chain, l) -= num;
            self.check_safety(&chain, l, &mut success, &mut message);
            let bad = self.forest.bad_cells_at_level(c, l) as i32;
            if bad > 0 {
                self.decrement_bad_free(&chain, l, bad);
            } else {
                self.check_vc_doomed_bad(&chain, l);
            }
            num *= fanouts[l as usize - 1];
        }

        let mut cur = c;
        loop {
            let cur_level = self.forest.phys(cur).level;
            let parent = self.forest.phys(cur).parent;
            let mut terminate = false;
            match parent {
                Some(parent) => {
                    if self.forest.phys(parent).split {
                        terminate = true;
                    } else {
                        let children = self.forest.phys(parent).children.clone();
                        let list = self
                            .free_lists
                            .get_mut(&chain)
                            .expect("every chain has a free list");
                        for child in children {
                            list.push(cur_level, child);
                        }
                        self.forest.phys_mut(parent).split = true;
                    }
                }
                None => terminate = true,
            }
            self.free_lists
                .get_mut(&chain)
                .expect("every chain has a free list")
                .remove(cur_level, cur);
            *self.total_left_mut(&chain, cur_level) -= 1;
            self.check_safety(&chain, cur_level, &mut success, &mut message);
            if self.forest.phys(cur).healthiness == CellHealthiness::Bad {
                self.decrement_bad_free(&chain, cur_level, 1);
            } else {
                self.check_vc_doomed_bad(&chain, cur_level);
            }
            if terminate {
                break;
            }
            cur = parent.expect("terminate is set when there is no parent");
        }
        (success, message)
    }

    /// Add a cell back to the free list, merging buddies up the tree
    /// while a whole sibling set is free.
    pub(crate) fn add_cell_to_free_list(&mut self, c: PhysicalCellId) {
        let (chain, level) = {
            let cell = self.forest.phys(c);
            (cell.chain.clone(), cell.level)
        };
        let fanouts: Vec<i32> = {
            let info = self.forest.chain(&chain);
            (1..=info.top_level()).map(|l| info.fanout(l) as i32).collect()
        };

        // Descendants of the freed cell become obtainable again.
        let mut num = fanouts[level as usize - 1];
        for l in (1..level).rev() {
            *self.total_left_mut(&chain, l) += num;
            let bad = self.forest.bad_cells_at_level(c, l) as i32;
            if bad > 0 {
                self.increment_bad_free(&chain, l, bad);
            } else {
                self.check_vc_doomed_bad(&chain, l);
            }
            num *= fanouts[l as usize - 1];
        }

        let mut cur = c;
        loop {
            let cur_level = self.forest.phys(cur).level;
            let parent = self.forest.phys(cur).parent;
            let mut terminate = false;
            match parent {
                Some(parent) => {
                    let buddies = self.forest.phys(parent).children.clone();
                    let mergeable = {
                        let list = self
                            .free_lists
                            .get(&chain)
                            .expect("every chain has a free list");
                        buddies.iter().all(|&buddy| {
                            buddy == cur
                                || (self.forest.phys(buddy).virtual_cell.is_none()
                                    && !self.forest.phys(buddy).split
                                    && list.contains(cur_level, buddy))
                        })
                    };
                    if mergeable {
                        let list = self
                            .free_lists
                            .get_mut(&chain)
                            .expect("every chain has a free list");
                        for &buddy in &buddies {
                            if buddy != cur {
                                list.remove(cur_level, buddy);
                            }
                        }
                        self.forest.phys_mut(parent).split = false;
                    } else {
                        terminate = true;
                    }
                }
                None => terminate = true,
            }
            *self.total_left_mut(&chain, cur_level) += 1;
            if self.forest.phys(cur).healthiness == CellHealthiness::Bad {
                self.increment_bad_free(&chain, cur_level, 1);
            } else {
                self.check_vc_doomed_bad(&chain, cur_level);
            }
            if terminate {
                self.free_lists
                    .get_mut(&chain)
                    .expect("every chain has a free list")
                    .push(cur_level, cur);
                break;
            }
            cur = parent.expect("terminate is set when there is no parent");
        }
    }

    /// True when the cell is free or could be obtained by splitting a
    /// free cell: no self-or-ancestor binding, and a self-or-ancestor
    /// present in the free list.
    pub(crate) fn in_free_candidate_path(&self, c: PhysicalCellId) -> bool {
        let chain = self.forest.phys(c).chain.clone();
        let Some(list) = self.free_lists.get(&chain) else {
            return false;
        };
        let mut cur = c;
        loop {
            let cell = self.forest.phys(cur);
            if cell.virtual_cell.is_some() || cell.pre_bound_virtual.is_some() || cell.reserved {
                return false;
            }
            if list.contains(cell.level, cur) {
                return true;
            }
            match cell.parent {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    fn check_safety(
        &mut self,
        chain: &str,
        level: u32,
        success: &mut bool,
        message: &mut Option<String>,
    ) {
        let left = self.total_left_at(chain, level);
        let needed = self.all_vc_free_at(chain, level);
        if left < needed {
            *success = false;
            let cell_type = self.forest.chain(chain).level(level).cell_type.clone();
            let text = format!(
                "adding pod would lead to broken safety: cell type {cell_type}, \
                 {left} left, {needed} free cells in all VCs"
            );
            warn!(chain, level, "{text}");
            *message = Some(text);
            self.broken_safety.insert((chain.to_string(), level));
        }
    }
}
