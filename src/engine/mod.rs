//! The execution engine.
//!
//! [`Engine`] owns the hart, the host bus, and the decoded-block machinery,
//! and drives execution as a trampoline: each handler reports where control
//! goes next and the dispatcher tail-chains through linked successor blocks
//! without returning to the driver. The chain breaks only on unlinked
//! control transfers, traps, environment calls, a hot-promotion signal, or
//! the end of the time slice; hart state is committed at every break.

pub mod bht;
pub mod block;
pub mod cache;
pub mod decode;
pub mod exec;
pub mod op;

use thiserror::Error;

use crate::config::Config;
use crate::cpu::trap::{self, Trap};
use crate::cpu::Cpu;
use crate::io::Bus;
use crate::snapshot::{self, SnapshotError};
use bht::BranchHistory;
use block::{build_block, Block, BlockMap};
use cache::BlockCache;
use exec::{exec, Action};
use op::{BlockId, OpRef, TermKind};

/// Host-visible engine failures. Architectural traps are not errors; they
/// flow through the trap unit.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("instruction fetch failed at {addr:#010x} during block construction")]
    FetchFault { addr: u32 },
    #[error("block at {pc:#010x} exceeded {limit} operations without a terminator")]
    RunawayBlock { pc: u32, limit: usize },
}

/// Execution counters.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub blocks_built: u64,
    pub bht_hits: u64,
    pub bht_misses: u64,
    pub hot_exits: u64,
}

/// Which successor slot of a terminator is being resolved.
#[derive(Clone, Copy)]
enum LinkSide {
    Taken,
    Untaken,
}

/// A hart bound to a host bus.
pub struct Engine<B: Bus> {
    pub cpu: Cpu,
    pub bus: B,
    cfg: Config,
    blocks: BlockMap,
    cache: BlockCache,
    bhts: Vec<BranchHistory>,
    stats: Stats,
}

impl<B: Bus> Engine<B> {
    pub fn new(bus: B, cfg: Config) -> Self {
        let cpu = Cpu::new(&cfg);
        let cache = BlockCache::new(cfg.block_cache_capacity, cfg.hot_threshold);
        Engine {
            cpu,
            bus,
            cfg,
            blocks: BlockMap::new(),
            cache,
            bhts: Vec::new(),
            stats: Stats::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Block-map consultations so far (cache hits bypass the map).
    pub fn map_lookups(&self) -> u64 {
        self.blocks.lookups
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_block_resident(&self, pc: u32) -> bool {
        self.blocks.resident(pc).is_some()
    }

    /// The hot predicate over the block cache.
    pub fn is_hot(&self, pc: u32) -> bool {
        self.cache.is_hot(pc)
    }

    pub fn cache_evictions(&self) -> u64 {
        self.cache.evictions
    }

    /// Drop all decoded state: block map, cache, and branch histories.
    /// Required after guest instruction memory changes.
    pub fn flush_blocks(&mut self) {
        log::debug!("flushing {} blocks", self.blocks.len());
        self.blocks.clear();
        self.cache.clear();
        self.bhts.clear();
    }

    /// Serialize the architectural state (registers, CSRs, FPU, flags).
    pub fn save_state(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::save(&self.cpu)
    }

    /// Restore architectural state and rebuild decoded state from scratch.
    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        self.cpu = snapshot::restore(bytes)?;
        self.flush_blocks();
        Ok(())
    }

    /// Run until the hart halts or `max_cycles` operations retire.
    /// Returns the number of cycles executed.
    pub fn run(&mut self, max_cycles: u64) -> Result<u64, EngineError> {
        let start = self.cpu.csr.cycle;
        while !self.cpu.halt && self.cpu.csr.cycle.wrapping_sub(start) < max_cycles {
            self.dispatch()?;
        }
        Ok(self.cpu.csr.cycle.wrapping_sub(start))
    }

    /// One dispatch episode: enter at `cpu.pc`, chain until a yield.
    pub fn dispatch(&mut self) -> Result<(), EngineError> {
        let entry = self.enter_block(self.cpu.pc)?;
        let mut cur = Block::head(entry);
        let mut cycle: u64 = 0;

        loop {
            let op = *self.blocks.op(cur);
            cycle += 1;

            match exec(&mut self.cpu, &mut self.bus, &op) {
                Action::Next => {
                    cur.index += 1;
                    debug_assert!(
                        (cur.index as usize) < self.blocks.block(cur.block).ops.len(),
                        "straight-line op at end of block {:#010x}",
                        op.pc
                    );
                }

                Action::Branch { taken, target } => {
                    let (sel_pc, side) = if taken {
                        (target, LinkSide::Taken)
                    } else {
                        (op.next_pc(), LinkSide::Untaken)
                    };
                    if taken && !self.aligned(target) {
                        self.cpu.csr.cycle += cycle;
                        trap::take(
                            &mut self.cpu,
                            Trap::InstructionAddressMisaligned(target),
                            op.pc,
                        );
                        return Ok(());
                    }
                    match self.follow(cur, side, sel_pc, cycle) {
                        Some(next) => cur = next,
                        None => return Ok(()),
                    }
                }

                Action::Jump { target } => {
                    if !self.aligned(target) {
                        self.cpu.csr.cycle += cycle;
                        trap::take(
                            &mut self.cpu,
                            Trap::InstructionAddressMisaligned(target),
                            op.pc,
                        );
                        return Ok(());
                    }
                    match self.follow(cur, LinkSide::Taken, target, cycle) {
                        Some(next) => cur = next,
                        None => return Ok(()),
                    }
                }

                Action::JumpIndirect { target } => {
                    if !self.aligned(target) {
                        self.cpu.csr.cycle += cycle;
                        trap::take(
                            &mut self.cpu,
                            Trap::InstructionAddressMisaligned(target),
                            op.pc,
                        );
                        return Ok(());
                    }
                    let slot = match op.bht {
                        Some(s) => s as usize,
                        None => panic!(
                            "indirect jump at {:#010x} without a branch-history table",
                            op.pc
                        ),
                    };
                    if let Some(next) = self.bhts[slot].lookup(target) {
                        self.stats.bht_hits += 1;
                        self.cache.get(target);
                        if self.cache.take_hot(target) {
                            self.stats.hot_exits += 1;
                            self.commit(target, cycle);
                            return Ok(());
                        }
                        cur = next;
                    } else {
                        self.stats.bht_misses += 1;
                        let id = self.map_or_build(target)?;
                        let head = Block::head(id);
                        self.bhts[slot].record(target, head);
                        self.cache.put(target, id);
                        self.cache.get(target);
                        cur = head;
                    }
                }

                Action::Retire { next_pc } => {
                    self.commit(next_pc, cycle);
                    return Ok(());
                }

                Action::Fencei { next_pc } => {
                    self.flush_blocks();
                    self.commit(next_pc, cycle);
                    return Ok(());
                }

                Action::Ecall => {
                    self.cpu.compressed = op.insn_len == 2;
                    self.commit(op.pc, cycle);
                    self.bus.on_ecall(&mut self.cpu);
                    return Ok(());
                }

                Action::Ebreak => {
                    self.cpu.compressed = op.insn_len == 2;
                    self.commit(op.pc, cycle);
                    self.bus.on_ebreak(&mut self.cpu);
                    return Ok(());
                }

                Action::Halt => {
                    self.cpu.halt = true;
                    self.commit(op.next_pc(), cycle);
                    return Ok(());
                }

                Action::Trap(t) => {
                    self.cpu.csr.cycle += cycle;
                    trap::take(&mut self.cpu, t, op.pc);
                    return Ok(());
                }
            }
        }
    }

    #[inline(always)]
    fn aligned(&self, pc: u32) -> bool {
        pc & self.cfg.pc_align_mask() == 0
    }

    fn commit(&mut self, pc: u32, cycle: u64) {
        self.cpu.pc = pc;
        self.cpu.csr.cycle += cycle;
    }

    /// Follow a static successor link, patching it lazily on first
    /// traversal. Returns the next op to chain into, or `None` after
    /// committing (unlinked target or hot exit).
    fn follow(&mut self, cur: OpRef, side: LinkSide, sel_pc: u32, cycle: u64) -> Option<OpRef> {
        let next = self.resolve_link(cur, side, sel_pc);
        match next {
            Some(next) => {
                if self.cache.take_hot(sel_pc) {
                    self.stats.hot_exits += 1;
                    self.commit(sel_pc, cycle);
                    return None;
                }
                Some(next)
            }
            None => {
                self.commit(sel_pc, cycle);
                None
            }
        }
    }

    fn resolve_link(&mut self, cur: OpRef, side: LinkSide, sel_pc: u32) -> Option<OpRef> {
        let op = self.blocks.op(cur);
        let link = match side {
            LinkSide::Taken => op.taken,
            LinkSide::Untaken => op.untaken,
        };
        if let Some(next) = link {
            self.cache.get(sel_pc); // access accounting for hotness
            return Some(next);
        }
        let id = self.blocks.resident(sel_pc)?;
        let head = Block::head(id);
        let op = self.blocks.op_mut(cur);
        match side {
            LinkSide::Taken => op.taken = Some(head),
            LinkSide::Untaken => op.untaken = Some(head),
        }
        self.cache.put(sel_pc, id);
        self.cache.get(sel_pc);
        Some(head)
    }

    /// Dispatch entry: cache first, then the map, building on a full miss.
    fn enter_block(&mut self, pc: u32) -> Result<BlockId, EngineError> {
        if let Some(id) = self.cache.get(pc) {
            return Ok(id);
        }
        let id = self.map_or_build(pc)?;
        self.cache.put(pc, id);
        self.cache.get(pc);
        Ok(id)
    }

    /// Authoritative lookup, building and installing the block on a miss.
    fn map_or_build(&mut self, pc: u32) -> Result<BlockId, EngineError> {
        if let Some(id) = self.blocks.get(pc) {
            return Ok(id);
        }
        let built = build_block(&mut self.bus, &self.cfg, pc)?;
        let id = self.blocks.insert(built);
        self.stats.blocks_built += 1;
        self.attach_bht(id);
        self.link_block(id);
        Ok(id)
    }

    /// Give a fresh branch-history table to an indirect-jump terminator.
    fn attach_bht(&mut self, id: BlockId) {
        let block = self.blocks.block(id);
        if block.term != TermKind::IndirectJump {
            return;
        }
        let slot = self.bhts.len() as u32;
        let last = block.ops.len() as u32 - 1;
        self.bhts.push(BranchHistory::new(self.cfg.history_size));
        self.blocks
            .op_mut(OpRef {
                block: id,
                index: last,
            })
            .bht = Some(slot);
    }

    /// Populate the terminator's static successor links for targets that
    /// are already resident. Unresolved links stay empty and are patched
    /// on first traversal.
    fn link_block(&mut self, id: BlockId) {
        let block = self.blocks.block(id);
        let last_index = block.ops.len() as u32 - 1;
        let term_ref = OpRef {
            block: id,
            index: last_index,
        };
        let term = *self.blocks.op(term_ref);

        match block.term {
            TermKind::Branch => {
                let taken_pc = term.pc.wrapping_add(term.imm as u32);
                let untaken_pc = term.next_pc();
                let taken = self.blocks.resident(taken_pc).map(Block::head);
                let untaken = self.blocks.resident(untaken_pc).map(Block::head);
                let op = self.blocks.op_mut(term_ref);
                op.taken = taken;
                op.untaken = untaken;
            }
            TermKind::Jump => {
                let taken_pc = term.pc.wrapping_add(term.imm as u32);
                let taken = self.blocks.resident(taken_pc).map(Block::head);
                self.blocks.op_mut(term_ref).taken = taken;
            }
            _ => {}
        }
    }
}
