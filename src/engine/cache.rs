//! Bounded block cache with frequency promotion.
//!
//! A linking hint over the block map: entries carry an access counter, the
//! hot predicate fires once the counter crosses the configured threshold,
//! and eviction targets the least-frequently-used entry that is not hot.
//! Eviction drops only the cache entry; arena storage and outstanding op
//! references are untouched.

use std::collections::HashMap;

use super::op::BlockId;

struct Entry {
    block: BlockId,
    freq: u32,
    /// Set once the hot-crossing signal has been delivered
    signaled: bool,
}

pub struct BlockCache {
    entries: HashMap<u32, Entry>,
    capacity: usize,
    hot_threshold: u32,
    pub evictions: u64,
}

impl BlockCache {
    pub fn new(capacity: usize, hot_threshold: u32) -> Self {
        BlockCache {
            entries: HashMap::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            hot_threshold: hot_threshold.max(1),
            evictions: 0,
        }
    }

    /// Lookup by entry PC; a hit bumps the access counter.
    pub fn get(&mut self, pc: u32) -> Option<BlockId> {
        let entry = self.entries.get_mut(&pc)?;
        entry.freq = entry.freq.saturating_add(1);
        Some(entry.block)
    }

    /// Insert or refresh an entry. On overflow the least-frequently-used
    /// non-hot entry is evicted; if everything is hot, the coldest entry
    /// goes anyway.
    pub fn put(&mut self, pc: u32, block: BlockId) {
        if let Some(entry) = self.entries.get_mut(&pc) {
            entry.block = block;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            pc,
            Entry {
                block,
                freq: 0,
                signaled: false,
            },
        );
    }

    fn evict_one(&mut self) {
        let threshold = self.hot_threshold;
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.freq < threshold)
            .min_by_key(|(_, e)| e.freq)
            .map(|(&pc, _)| pc)
            .or_else(|| {
                self.entries
                    .iter()
                    .min_by_key(|(_, e)| e.freq)
                    .map(|(&pc, _)| pc)
            });
        if let Some(pc) = victim {
            self.entries.remove(&pc);
            self.evictions += 1;
        }
    }

    /// Monotonic hot predicate: true once the access counter has crossed
    /// the threshold.
    pub fn is_hot(&self, pc: u32) -> bool {
        self.entries
            .get(&pc)
            .map_or(false, |e| e.freq >= self.hot_threshold)
    }

    /// Edge-triggered hot signal: true exactly once, when the counter
    /// crosses the threshold. The dispatcher breaks its chain on this so
    /// the driver can hand the block to a compiled tier.
    pub fn take_hot(&mut self, pc: u32) -> bool {
        match self.entries.get_mut(&pc) {
            Some(e) if e.freq >= self.hot_threshold && !e.signaled => {
                e.signaled = true;
                log::debug!("block {:#010x} promoted to hot (freq {})", pc, e.freq);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
