//! Per-indirect-jump branch-history tables.
//!
//! Each JALR-class op owns a small direct-mapped table of
//! (target PC, first op) pairs with a rotating replacement index, so a
//! computed jump whose target was seen before dispatches without touching
//! the block map.

use super::op::OpRef;

pub struct BranchHistory {
    entries: Vec<Option<(u32, OpRef)>>,
    idx: usize,
}

impl BranchHistory {
    pub fn new(size: usize) -> Self {
        BranchHistory {
            entries: vec![None; size.max(1)],
            idx: 0,
        }
    }

    /// Linear scan for a recorded target.
    pub fn lookup(&self, pc: u32) -> Option<OpRef> {
        self.entries
            .iter()
            .flatten()
            .find(|(target_pc, _)| *target_pc == pc)
            .map(|(_, op)| *op)
    }

    /// Record a resolved target at the rotating index.
    pub fn record(&mut self, pc: u32, target: OpRef) {
        self.entries[self.idx] = Some((pc, target));
        self.idx = (self.idx + 1) % self.entries.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opref(block: u32) -> OpRef {
        OpRef { block, index: 0 }
    }

    #[test]
    fn test_lookup_after_record() {
        let mut bht = BranchHistory::new(4);
        assert_eq!(bht.lookup(0x100), None);
        bht.record(0x100, opref(3));
        assert_eq!(bht.lookup(0x100), Some(opref(3)));
        assert_eq!(bht.lookup(0x200), None);
    }

    #[test]
    fn test_rotating_replacement() {
        let mut bht = BranchHistory::new(2);
        bht.record(0x100, opref(1));
        bht.record(0x200, opref(2));
        bht.record(0x300, opref(3)); // overwrites the 0x100 slot
        assert_eq!(bht.lookup(0x100), None);
        assert_eq!(bht.lookup(0x200), Some(opref(2)));
        assert_eq!(bht.lookup(0x300), Some(opref(3)));
    }

    #[test]
    fn test_zero_size_clamped() {
        let mut bht = BranchHistory::new(0);
        bht.record(0x100, opref(1));
        assert_eq!(bht.lookup(0x100), Some(opref(1)));
    }
}
