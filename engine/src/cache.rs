// cache.rs - Translation block cache
//
// Maps a block start address to its descriptor, execution counter, and
// (once hot) compiled routine. The cache exclusively owns every entry
// and every routine; other components only borrow an entry for the
// duration of a single dispatch step.

use std::collections::HashMap;
use std::ops::Range;

use log::{debug, error};

use crate::block::{self, BasicBlock, BlockLimits};
use crate::compiler::Routine;
use crate::decode::DecodeError;
use crate::mem::GuestMemory;

/// One cache entry: a basic block plus its execution lifecycle.
pub struct TranslationBlock {
    pub block: BasicBlock,
    /// Interpreted executions so far.
    execs: u64,
    /// Present once the block has been compiled. Set at most once.
    pub routine: Option<Box<dyn Routine>>,
    /// Compilation failed; interpret this block forever.
    pub compile_failed: bool,
    /// Recency tick for eviction.
    last_used: u64,
}

impl TranslationBlock {
    fn new(block: BasicBlock) -> Self {
        Self {
            block,
            execs: 0,
            routine: None,
            compile_failed: false,
            last_used: 0,
        }
    }

    /// Record one interpreted execution; returns the new count.
    pub fn record_execution(&mut self) -> u64 {
        self.execs += 1;
        self.execs
    }

    pub fn execution_count(&self) -> u64 {
        self.execs
    }

    /// Install the compiled routine. Installing twice is a logic error:
    /// the call is ignored and reported, preserving the at-most-once
    /// compilation invariant.
    pub fn install_routine(&mut self, routine: Box<dyn Routine>) {
        if self.routine.is_some() {
            error!(
                "routine already installed for block at {:#x}; install ignored",
                self.block.start
            );
            return;
        }
        self.routine = Some(routine);
    }
}

/// Cache of translation blocks keyed by start address, bounded by a
/// least-recently-used eviction policy.
pub struct TranslationCache {
    entries: HashMap<u32, TranslationBlock>,
    capacity: usize,
    tick: u64,
}

impl TranslationCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "translation cache capacity must be nonzero");
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn lookup(&mut self, addr: u32) -> Option<&mut TranslationBlock> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(&addr)?;
        entry.last_used = tick;
        Some(entry)
    }

    /// Return the entry for `addr`, building the block on first contact.
    /// Construction happens exactly once per address; repeated calls
    /// return the same entry.
    pub fn get_or_create(
        &mut self,
        addr: u32,
        mem: &GuestMemory,
        limits: BlockLimits,
    ) -> Result<&mut TranslationBlock, DecodeError> {
        self.tick += 1;
        let tick = self.tick;

        if !self.entries.contains_key(&addr) {
            let block = block::build_block(mem, addr, limits)?;
            debug!(
                "built block {:#x}..{:#x} ({} instructions)",
                block.start,
                block.end,
                block.instructions.len()
            );
            self.evict_for_insert();
            self.entries.insert(addr, TranslationBlock::new(block));
        }

        let entry = self
            .entries
            .get_mut(&addr)
            .expect("entry inserted or present");
        entry.last_used = tick;
        Ok(entry)
    }

    /// Evict an entry and release its routine.
    pub fn invalidate(&mut self, addr: u32) -> bool {
        let hit = self.entries.remove(&addr).is_some();
        if hit {
            debug!("invalidated translation for {addr:#x}");
        }
        hit
    }

    /// Evict every entry whose byte range intersects a written range.
    /// Called by the dispatcher whenever guest code memory may have been
    /// modified (self-modifying code). Returns how many entries died.
    pub fn invalidate_overlapping(&mut self, range: &Range<u32>) -> usize {
        let stale: Vec<u32> = self
            .entries
            .values()
            .filter(|e| e.block.overlaps(range))
            .map(|e| e.block.start)
            .collect();
        for addr in &stale {
            debug!(
                "write to {:#x}..{:#x} invalidated translation at {addr:#x}",
                range.start, range.end
            );
            self.entries.remove(addr);
        }
        stale.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Make room for one insertion, dropping the least recently used
    /// entry if the cache is full.
    fn evict_for_insert(&mut self) {
        if self.entries.len() < self.capacity {
            return;
        }
        if let Some(addr) = self
            .entries
            .values()
            .min_by_key(|e| e.last_used)
            .map(|e| e.block.start)
        {
            debug!("cache full, evicting block at {addr:#x}");
            self.entries.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuState;
    use crate::cpu::GuestTrap;

    fn memory_with(bytes: &[u8]) -> GuestMemory {
        let mem = GuestMemory::new(256);
        mem.load_image(0, bytes).unwrap();
        mem
    }

    struct NopRoutine;
    impl Routine for NopRoutine {
        fn invoke(&mut self, _cpu: &mut CpuState) -> Result<(), GuestTrap> {
            Ok(())
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mem = memory_with(&[0x00, 0x00, 0x00]);
        let mut cache = TranslationCache::new(8);

        let first = cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        first.record_execution();
        let first_ptr = first as *const TranslationBlock;

        let again = cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        assert_eq!(again as *const TranslationBlock, first_ptr);
        assert_eq!(again.execution_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn install_twice_is_rejected() {
        let mem = memory_with(&[0x00]);
        let mut cache = TranslationCache::new(8);
        let entry = cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        entry.install_routine(Box::new(NopRoutine));
        assert!(entry.routine.is_some());
        // Second install is ignored, not a replacement.
        entry.install_routine(Box::new(NopRoutine));
        assert!(entry.routine.is_some());
    }

    #[test]
    fn invalidate_overlapping_hits_only_intersecting_blocks() {
        // Two single-HALT blocks at 0 and 8.
        let mem = memory_with(&[0x00, 0, 0, 0, 0, 0, 0, 0, 0x00]);
        let mut cache = TranslationCache::new(8);
        cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        cache.get_or_create(8, &mem, BlockLimits::default()).unwrap();

        assert_eq!(cache.invalidate_overlapping(&(8..16)), 1);
        assert!(cache.contains(0));
        assert!(!cache.contains(8));

        assert_eq!(cache.invalidate_overlapping(&(4..6)), 0);
        assert!(cache.contains(0));
    }

    #[test]
    fn lru_eviction_prefers_stale_entries() {
        let mem = memory_with(&[0x00, 0x00, 0x00, 0x00]);
        let mut cache = TranslationCache::new(2);
        cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        cache.get_or_create(1, &mem, BlockLimits::default()).unwrap();
        // Touch 0 so 1 becomes least recently used.
        cache.lookup(0).unwrap();
        cache.get_or_create(2, &mem, BlockLimits::default()).unwrap();
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }

    #[test]
    fn explicit_invalidate_releases_entry() {
        let mem = memory_with(&[0x00]);
        let mut cache = TranslationCache::new(4);
        let entry = cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        entry.install_routine(Box::new(NopRoutine));
        assert!(cache.invalidate(0));
        assert!(!cache.invalidate(0));
        // Rebuild starts a fresh lifecycle.
        let entry = cache.get_or_create(0, &mem, BlockLimits::default()).unwrap();
        assert_eq!(entry.execution_count(), 0);
        assert!(entry.routine.is_none());
    }
}
