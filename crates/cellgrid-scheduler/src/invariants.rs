//! Whole-engine consistency checks.
//!
//! These hold after every entry point returns. They are cheap enough to
//! run in tests after every step and are exposed publicly so operators
//! can assert them in a live engine when debugging.

use cellgrid_types::{CellHealthiness, CellState};

use crate::scheduler::{placement_cells, Scheduler};

impl Scheduler {
    /// Check every engine invariant, returning a description of each
    /// violation. An empty result means the engine is consistent.
    pub fn verify_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();
        self.check_cell_states(&mut violations);
        self.check_counters(&mut violations);
        self.check_free_list_structure(&mut violations);
        self.check_doomed_formula(&mut violations);
        self.check_preempting_groups(&mut violations);
        violations
    }

    /// State table and bad-propagation per cell.
    fn check_cell_states(&self, violations: &mut Vec<String>) {
        for chain in self.forest.chains() {
            for level in &chain.full_list {
                for &id in level {
                    let cell = self.forest.phys(id);
                    let consistent = match cell.state {
                        CellState::Free => {
                            cell.using_group.is_none() && cell.acquiring_group.is_none()
                        }
                        CellState::Used => {
                            cell.using_group.is_some() && cell.acquiring_group.is_none()
                        }
                        CellState::Acquiring => {
                            cell.using_group.is_some() && cell.acquiring_group.is_some()
                        }
                        CellState::Acquired => {
                            cell.using_group.is_none() && cell.acquiring_group.is_some()
                        }
                    };
                    if !consistent {
                        violations.push(format!(
                            "cell {}: state {:?} inconsistent with using={:?} acquiring={:?}",
                            cell.address, cell.state, cell.using_group, cell.acquiring_group
                        ));
                    }

                    let leaf_count = chain.level(cell.level).leaf_count;
                    let bad_leaves = self.forest.bad_cells_at_level(id, 1);
                    let all_leaves_bad = bad_leaves == leaf_count;
                    if (cell.healthiness == CellHealthiness::Bad) != all_leaves_bad {
                        violations.push(format!(
                            "cell {}: healthiness {:?} but {bad_leaves}/{leaf_count} leaves bad",
                            cell.address, cell.healthiness
                        ));
                    }
                }
            }
        }
    }

    /// `totalLeft` and `badFree` agree with the free-list structure,
    /// and safety holds wherever it has not been reported broken.
    fn check_counters(&self, violations: &mut Vec<String>) {
        for chain in self.forest.chains() {
            let list = &self.free_lists[&chain.name];
            for level in 1..=chain.top_level() {
                let mut expected_total = 0i64;
                let mut expected_bad = 0i64;
                for upper in level..=chain.top_level() {
                    let per_cell = (chain.level(upper).leaf_count
                        / chain.level(level).leaf_count) as i64;
                    expected_total += list.len_at(upper) as i64 * per_cell;
                    for &free in list.at_level(upper) {
                        expected_bad += self.forest.bad_cells_at_level(free, level) as i64;
                    }
                }
                let total = self.total_left_at(&chain.name, level) as i64;
                if total != expected_total {
                    violations.push(format!(
                        "chain {} level {level}: totalLeft {total} != structural {expected_total}",
                        chain.name
                    ));
                }
                let bad = self.bad_free_at(&chain.name, level) as i64;
                if bad != expected_bad {
                    violations.push(format!(
                        "chain {} level {level}: badFree {bad} != structural {expected_bad}",
                        chain.name
                    ));
                }
                let needed = self.all_vc_free_at(&chain.name, level) as i64;
                if needed > total && !self.broken_safety.contains(&(chain.name.clone(), level)) {
                    violations.push(format!(
                        "chain {} level {level}: allVCFree {needed} > totalLeft {total} \
                         without reported broken safety",
                        chain.name
                    ));
                }
            }
        }
    }

    /// Free-list cells are unsplit and unbound; non-root entries sit
    /// under a split parent.
    fn check_free_list_structure(&self, violations: &mut Vec<String>) {
        for chain in self.forest.chains() {
            let list = &self.free_lists[&chain.name];
            for level in 1..=chain.top_level() {
                for &id in list.at_level(level) {
                    let cell = self.forest.phys(id);
                    if cell.split {
                        violations.push(format!("free cell {} is split", cell.address));
                    }
                    if cell.virtual_cell.is_some() {
                        violations.push(format!("free cell {} is bound", cell.address));
                    }
                    if let Some(parent) = cell.parent {
                        if !self.forest.phys(parent).split {
                            violations.push(format!(
                                "free cell {} has an unsplit parent",
                                cell.address
                            ));
                        }
                    }
                }
            }
        }
    }

    /// `doomedBad = max(0, vcFree - (totalLeft - badFree))` per VC.
    fn check_doomed_formula(&self, violations: &mut Vec<String>) {
        for ((vc, chain, level), &vc_free) in &self.vc_free {
            let healthy_left = self.total_left_at(chain, *level) - self.bad_free_at(chain, *level);
            let expected = (vc_free - healthy_left).max(0);
            let doomed = self.doomed_at(vc, chain, *level);
            if doomed != expected {
                violations.push(format!(
                    "vc {vc} chain {chain} level {level}: doomedBad {doomed} != {expected}"
                ));
            }
        }
    }

    /// Every cell of a preempting group is Acquiring or Acquired.
    fn check_preempting_groups(&self, violations: &mut Vec<String>) {
        for (name, group) in &self.preemptor_groups {
            for p in placement_cells(&group.physical_placement) {
                let cell = self.forest.phys(p);
                if !matches!(cell.state, CellState::Acquiring | CellState::Acquired) {
                    violations.push(format!(
                        "preempting group {name}: cell {} in state {:?}",
                        cell.address, cell.state
                    ));
                }
            }
        }
    }
}
