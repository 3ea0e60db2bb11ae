//! Basic blocks, the block builder, and the arena-backed block map.
//!
//! A block is a maximal straight-line run of decoded operations ending in
//! exactly one control transfer. Blocks live in an arena and are never
//! freed while the program runs; successor links between blocks are plain
//! arena indices, which breaks the ownership cycle the branch graph would
//! otherwise create.

use std::collections::HashMap;

use super::decode::decode;
use super::op::{BlockId, Op, OpRef, TermKind};
use super::EngineError;
use crate::config::Config;
use crate::io::Bus;

/// Backstop against decoding through gigabytes of straight-line memory.
/// Hitting it means the engine is being pointed at non-code.
pub const MAX_BLOCK_OPS: usize = 4096;

/// A decoded basic block.
#[derive(Debug)]
pub struct Block {
    /// PC of the first operation
    pub entry_pc: u32,
    /// PC one past the last operation
    pub end_pc: u32,
    /// The operations; the terminator is always last
    pub ops: Vec<Op>,
    /// Classification of the terminator
    pub term: TermKind,
}

impl Block {
    /// Reference to the first op, for tail-call entry.
    #[inline(always)]
    pub fn head(id: BlockId) -> OpRef {
        OpRef {
            block: id,
            index: 0,
        }
    }
}

/// Walk memory from `entry_pc`, decoding and appending until a terminator
/// lands. A fetch failure aborts the build and discards the partial block.
pub fn build_block<B: Bus>(bus: &mut B, cfg: &Config, entry_pc: u32) -> Result<Block, EngineError> {
    let mut ops = Vec::new();
    let mut pc = entry_pc;

    loop {
        let raw = bus
            .fetch32(pc)
            .ok_or(EngineError::FetchFault { addr: pc })?;
        let op = decode(raw, pc, cfg);
        pc = pc.wrapping_add(op.insn_len as u32);
        let term = op.kind.terminator();
        ops.push(op);

        if let Some(term) = term {
            log::trace!(
                "built block {:#010x}..{:#010x} ({} ops, {:?})",
                entry_pc,
                pc,
                ops.len(),
                term
            );
            return Ok(Block {
                entry_pc,
                end_pc: pc,
                ops,
                term,
            });
        }
        if ops.len() >= MAX_BLOCK_OPS {
            return Err(EngineError::RunawayBlock {
                pc: entry_pc,
                limit: MAX_BLOCK_OPS,
            });
        }
    }
}

/// The authoritative PC-indexed store of every block ever decoded.
///
/// Unbounded: blocks are owned by the arena from first build until program
/// teardown (or a FENCE.I flush), because ops in other blocks hold
/// [`OpRef`]s into them.
pub struct BlockMap {
    arena: Vec<Block>,
    index: HashMap<u32, BlockId>,
    /// Map consultations, for profiling the BHT short-circuit
    pub lookups: u64,
}

impl BlockMap {
    pub fn new() -> Self {
        BlockMap {
            arena: Vec::new(),
            index: HashMap::new(),
            lookups: 0,
        }
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Counted lookup by entry PC.
    pub fn get(&mut self, pc: u32) -> Option<BlockId> {
        self.lookups += 1;
        self.index.get(&pc).copied()
    }

    /// Uncounted lookup, for the static linker.
    pub fn resident(&self, pc: u32) -> Option<BlockId> {
        self.index.get(&pc).copied()
    }

    /// Install a block. If one is already resident at its entry PC the
    /// existing block wins (at-most-one rule) and the candidate is dropped.
    pub fn insert(&mut self, block: Block) -> BlockId {
        if let Some(&id) = self.index.get(&block.entry_pc) {
            return id;
        }
        let id = self.arena.len() as BlockId;
        self.index.insert(block.entry_pc, id);
        self.arena.push(block);
        id
    }

    #[inline(always)]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.arena[id as usize]
    }

    #[inline(always)]
    pub fn op(&self, r: OpRef) -> &Op {
        &self.arena[r.block as usize].ops[r.index as usize]
    }

    #[inline(always)]
    pub fn op_mut(&mut self, r: OpRef) -> &mut Op {
        &mut self.arena[r.block as usize].ops[r.index as usize]
    }

    /// Drop every block (FENCE.I, snapshot restore). All outstanding
    /// [`OpRef`]s are invalidated together, so callers must not hold any.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.index.clear();
    }
}

impl Default for BlockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::op::Opcode;
    use crate::io::FlatMemory;

    fn image(words: &[u32]) -> FlatMemory {
        let mut mem = FlatMemory::new(0, 0x1000);
        for (i, w) in words.iter().enumerate() {
            mem.write32(i as u32 * 4, *w);
        }
        mem
    }

    #[test]
    fn test_block_ends_at_terminator() {
        // addi x1, x0, 5 ; addi x1, x1, -2 ; ebreak ; addi x2, x0, 1
        let mut mem = image(&[0x0050_0093, 0xFFE0_8093, 0x0010_0073, 0x0010_0113]);
        let cfg = Config::default();
        let block = build_block(&mut mem, &cfg, 0).unwrap();
        assert_eq!(block.entry_pc, 0);
        assert_eq!(block.end_pc, 12);
        assert_eq!(block.ops.len(), 3);
        assert_eq!(block.term, TermKind::System);
        // exactly one terminator, and it is last
        for op in &block.ops[..block.ops.len() - 1] {
            assert!(!op.kind.is_terminator());
        }
        assert!(block.ops.last().unwrap().kind.is_terminator());
    }

    #[test]
    fn test_block_mixed_widths() {
        let mut mem = FlatMemory::new(0, 0x100);
        // c.addi x1, 1 at 0; then ebreak (32-bit) at 2
        mem.write16(0, 0b000_0_00001_00001_01);
        mem.write32(2, 0x0010_0073);
        let cfg = Config::default();
        let block = build_block(&mut mem, &cfg, 0).unwrap();
        assert_eq!(block.ops.len(), 2);
        assert_eq!(block.ops[0].kind, Opcode::CAddi);
        assert_eq!(block.ops[0].insn_len, 2);
        assert_eq!(block.end_pc, 6);
    }

    #[test]
    fn test_fetch_fault_aborts_build() {
        struct FailingBus(FlatMemory);
        impl Bus for FailingBus {
            fn read8(&mut self, a: u32) -> u8 {
                self.0.read8(a)
            }
            fn read16(&mut self, a: u32) -> u16 {
                self.0.read16(a)
            }
            fn read32(&mut self, a: u32) -> u32 {
                self.0.read32(a)
            }
            fn write8(&mut self, a: u32, v: u8) {
                self.0.write8(a, v)
            }
            fn write16(&mut self, a: u32, v: u16) {
                self.0.write16(a, v)
            }
            fn write32(&mut self, a: u32, v: u32) {
                self.0.write32(a, v)
            }
            fn fetch32(&mut self, addr: u32) -> Option<u32> {
                if addr >= 8 {
                    None
                } else {
                    Some(self.0.read32(addr))
                }
            }
        }

        let mut mem = FailingBus(image(&[0x0050_0093, 0x0050_0093]));
        let cfg = Config::default();
        let err = build_block(&mut mem, &cfg, 0).unwrap_err();
        assert!(matches!(err, EngineError::FetchFault { addr: 8 }));
    }

    #[test]
    fn test_map_at_most_one_per_pc() {
        let mut mem = image(&[0x0010_0073]);
        let cfg = Config::default();
        let mut map = BlockMap::new();
        let a = map.insert(build_block(&mut mem, &cfg, 0).unwrap());
        let b = map.insert(build_block(&mut mem, &cfg, 0).unwrap());
        assert_eq!(a, b);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_map_lookup_counting() {
        let mut map = BlockMap::new();
        assert_eq!(map.get(0), None);
        assert_eq!(map.lookups, 1);
        assert_eq!(map.resident(0), None);
        assert_eq!(map.lookups, 1);
    }

    #[test]
    fn test_illegal_terminates_block() {
        let mut mem = image(&[0xFFFF_FFFF]);
        let cfg = Config::default();
        let block = build_block(&mut mem, &cfg, 0).unwrap();
        assert_eq!(block.term, TermKind::Trap);
        assert_eq!(block.ops.len(), 1);
    }
}
