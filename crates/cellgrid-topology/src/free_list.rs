//! Per-chain free cell list.
//!
//! Holds, per level, the physical cells currently allocatable. Only the
//! structure lives here; the split/merge walking and the counters that
//! must move with it belong to the engine, so that one call updates
//! both together.

use tracing::warn;

use crate::cell::PhysicalCellId;

/// Free cells of one chain, per level (`level - 1` indexed internally).
/// Order is preserved on removal so iteration stays deterministic.
#[derive(Debug, Clone)]
pub struct FreeList {
    levels: Vec<Vec<PhysicalCellId>>,
}

impl FreeList {
    pub fn new(top_level: u32) -> FreeList {
        FreeList {
            levels: vec![Vec::new(); top_level as usize],
        }
    }

    pub fn push(&mut self, level: u32, id: PhysicalCellId) {
        self.levels[level as usize - 1].push(id);
    }

    pub fn remove(&mut self, level: u32, id: PhysicalCellId) {
        let cells = &mut self.levels[level as usize - 1];
        let before = cells.len();
        cells.retain(|&c| c != id);
        if cells.len() == before {
            warn!(level, ?id, "cell not found in the free list on removal");
        }
    }

    pub fn contains(&self, level: u32, id: PhysicalCellId) -> bool {
        self.levels[level as usize - 1].contains(&id)
    }

    pub fn at_level(&self, level: u32) -> &[PhysicalCellId] {
        &self.levels[level as usize - 1]
    }

    pub fn len_at(&self, level: u32) -> usize {
        self.levels[level as usize - 1].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> PhysicalCellId {
        PhysicalCellId(n)
    }

    #[test]
    fn push_remove_preserves_order() {
        let mut list = FreeList::new(2);
        list.push(1, id(0));
        list.push(1, id(1));
        list.push(1, id(2));
        list.remove(1, id(1));
        assert_eq!(list.at_level(1), &[id(0), id(2)]);
        assert_eq!(list.len_at(1), 2);
        assert!(!list.contains(1, id(1)));
    }

    #[test]
    fn levels_are_independent() {
        let mut list = FreeList::new(3);
        list.push(3, id(7));
        assert!(list.contains(3, id(7)));
        assert!(!list.contains(1, id(7)));
        assert!(!list.is_empty());
    }
}
