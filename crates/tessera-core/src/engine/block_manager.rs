//! Block-space management for the two-tier, two-class KV cache.
//!
//! Follows the paged-attention design:
//! - Free-list block allocation with per-block reference counts
//! - Per-sequence block tables for the retrieval and streaming classes
//! - Copy-on-write when a shared tail block is about to be mutated
//! - GPU/CPU migration of whole tables for preempted groups

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::config::CacheConfig;
use crate::engine::types::{BlockId, SeqId};
use crate::sequence::{SeqHandle, SequenceGroup, SequenceStatus};

/// Answer to a prompt-admission capacity query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// The group fits now.
    Ok,
    /// The group does not fit now but may once blocks free up.
    Later,
    /// The group can never fit; reject it permanently.
    Never,
}

/// Cache tier a block table currently lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Gpu,
    Cpu,
}

/// A copy-on-write instruction: clone `src` into `dst` before mutation.
pub type CowPair = (BlockId, BlockId);

/// Contract between the scheduler and the block-space manager.
///
/// The scheduler consumes only these predicates and plan outputs; alternate
/// managers substitute without touching the scheduling state machine. Every
/// mutator is synchronous and total with respect to its `can_*` predicate,
/// which the caller must check first.
pub trait BlockSpaceManager {
    /// Whether the prompt of a waiting group can be admitted.
    fn can_allocate(
        &self,
        seq_group: &SequenceGroup,
        ifb_mode: bool,
        init_num_blocks: Option<usize>,
    ) -> AllocStatus;

    /// Reserve block tables for the group's prompt sequence.
    fn allocate(&mut self, seq_group: &SequenceGroup, ifb_mode: bool, init_num_blocks: Option<usize>);

    /// Whether one more decode token fits for every running sequence.
    fn can_append_slot(&self, seq_group: &SequenceGroup) -> bool;

    /// Reserve one decode slot; returns at most one copy-on-write
    /// instruction per class.
    fn append_slot(&mut self, seq: &SeqHandle) -> (Option<CowPair>, Option<CowPair>);

    fn can_swap_in(&self, seq_group: &SequenceGroup) -> bool;

    /// Move the group's tables back to the GPU; returns CPU->GPU maps per
    /// class.
    fn swap_in(&mut self, seq_group: &SequenceGroup)
        -> (HashMap<BlockId, BlockId>, HashMap<BlockId, BlockId>);

    fn can_swap_out(&self, seq_group: &SequenceGroup) -> bool;

    /// Move the group's tables to CPU swap space; returns GPU->CPU maps per
    /// class.
    fn swap_out(&mut self, seq_group: &SequenceGroup)
        -> (HashMap<BlockId, BlockId>, HashMap<BlockId, BlockId>);

    /// Duplicate the parent's tables for a forked child sequence.
    fn fork(&mut self, parent_seq: &SeqHandle, child_seq: &SeqHandle);

    /// Release all blocks of a sequence. Unknown ids are a no-op.
    fn free(&mut self, seq_id: SeqId);

    fn get_retrieval_block_table(&self, seq_id: SeqId) -> Vec<BlockId>;

    /// `None` when the streaming class is disabled.
    fn get_streaming_block_table(&self, seq_id: SeqId) -> Option<Vec<BlockId>>;
}

/// Free-list allocator over a fixed pool of physical blocks.
struct BlockAllocator {
    num_blocks: usize,
    free_list: VecDeque<BlockId>,
    ref_counts: Vec<usize>,
}

impl BlockAllocator {
    fn new(num_blocks: usize) -> Self {
        Self {
            num_blocks,
            free_list: (0..num_blocks).collect(),
            ref_counts: vec![0; num_blocks],
        }
    }

    fn allocate(&mut self) -> Option<BlockId> {
        let block = self.free_list.pop_front()?;
        self.ref_counts[block] = 1;
        Some(block)
    }

    fn incr_ref(&mut self, block: BlockId) {
        self.ref_counts[block] += 1;
    }

    fn free(&mut self, block: BlockId) {
        let refs = &mut self.ref_counts[block];
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            self.free_list.push_back(block);
        }
    }

    fn ref_count(&self, block: BlockId) -> usize {
        self.ref_counts[block]
    }

    fn num_free(&self) -> usize {
        self.free_list.len()
    }

    fn num_total(&self) -> usize {
        self.num_blocks
    }
}

/// Block table of one sequence in one cache class.
#[derive(Debug, Clone)]
struct BlockTable {
    blocks: Vec<BlockId>,
    device: Device,
}

/// One cache class: a GPU pool, a CPU swap pool, and per-sequence tables.
struct CachePool {
    gpu: BlockAllocator,
    cpu: BlockAllocator,
    tables: HashMap<SeqId, BlockTable>,
}

impl CachePool {
    fn new(num_gpu_blocks: usize, num_cpu_blocks: usize) -> Self {
        Self {
            gpu: BlockAllocator::new(num_gpu_blocks),
            cpu: BlockAllocator::new(num_cpu_blocks),
            tables: HashMap::new(),
        }
    }

    fn allocate_table(&mut self, seq_id: SeqId, num_blocks: usize) {
        let mut blocks = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let block = self
                .gpu
                .allocate()
                .expect("GPU block pool exhausted; can_allocate must be checked first");
            blocks.push(block);
        }
        self.tables.insert(
            seq_id,
            BlockTable {
                blocks,
                device: Device::Gpu,
            },
        );
    }

    /// Grow the table to `num_blocks` and clone a shared tail block if one
    /// is about to be written.
    fn append_slot(&mut self, seq_id: SeqId, num_blocks: usize) -> Option<CowPair> {
        let table = self.tables.get_mut(&seq_id)?;
        debug_assert_eq!(table.device, Device::Gpu);

        let mut grown = false;
        while table.blocks.len() < num_blocks {
            let block = self
                .gpu
                .allocate()
                .expect("GPU block pool exhausted; can_append_slot must be checked first");
            table.blocks.push(block);
            grown = true;
        }
        if grown {
            // A fresh tail block is never shared.
            return None;
        }

        let last = *table.blocks.last()?;
        if self.gpu.ref_count(last) > 1 {
            let new_block = self
                .gpu
                .allocate()
                .expect("GPU block pool exhausted; can_append_slot must be checked first");
            if let Some(slot) = table.blocks.last_mut() {
                *slot = new_block;
            }
            self.gpu.free(last);
            return Some((last, new_block));
        }
        None
    }

    fn fork(&mut self, parent_id: SeqId, child_id: SeqId) {
        if let Some(table) = self.tables.get(&parent_id).cloned() {
            let allocator = match table.device {
                Device::Gpu => &mut self.gpu,
                Device::Cpu => &mut self.cpu,
            };
            for &block in &table.blocks {
                allocator.incr_ref(block);
            }
            self.tables.insert(child_id, table);
        }
    }

    fn free_seq(&mut self, seq_id: SeqId) {
        if let Some(table) = self.tables.remove(&seq_id) {
            let allocator = match table.device {
                Device::Gpu => &mut self.gpu,
                Device::Cpu => &mut self.cpu,
            };
            for &block in &table.blocks {
                allocator.free(block);
            }
        }
    }

    /// Distinct blocks the given sequences hold on `device`.
    fn distinct_blocks(&self, seq_ids: &[SeqId], device: Device) -> usize {
        let mut blocks: HashSet<BlockId> = HashSet::new();
        for seq_id in seq_ids {
            if let Some(table) = self.tables.get(seq_id) {
                if table.device == device {
                    blocks.extend(table.blocks.iter().copied());
                }
            }
        }
        blocks.len()
    }

    fn migrate(&mut self, seq_ids: &[SeqId], from: Device) -> HashMap<BlockId, BlockId> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        for seq_id in seq_ids {
            let Some(table) = self.tables.get_mut(seq_id) else {
                continue;
            };
            if table.device != from {
                continue;
            }
            let mut new_blocks = Vec::with_capacity(table.blocks.len());
            for &old_block in &table.blocks {
                let new_block = match mapping.get(&old_block) {
                    Some(&block) => {
                        // A block shared within the group moves once.
                        match from {
                            Device::Gpu => self.cpu.incr_ref(block),
                            Device::Cpu => self.gpu.incr_ref(block),
                        }
                        block
                    }
                    None => {
                        let block = match from {
                            Device::Gpu => self.cpu.allocate(),
                            Device::Cpu => self.gpu.allocate(),
                        }
                        .expect("target block pool exhausted; can_swap_* must be checked first");
                        mapping.insert(old_block, block);
                        block
                    }
                };
                match from {
                    Device::Gpu => self.gpu.free(old_block),
                    Device::Cpu => self.cpu.free(old_block),
                }
                new_blocks.push(new_block);
            }
            table.blocks = new_blocks;
            table.device = match from {
                Device::Gpu => Device::Cpu,
                Device::Cpu => Device::Gpu,
            };
        }
        mapping
    }
}

/// Streaming class: a cache pool whose per-sequence tables are capped by the
/// sparse-attention layout (sink blocks plus local-window blocks).
struct StreamingPool {
    pool: CachePool,
    max_blocks_per_seq: usize,
}

/// Concrete two-tier, two-class block-space manager.
pub struct PagedBlockManager {
    block_size: usize,
    retrieval: CachePool,
    streaming: Option<StreamingPool>,
}

impl PagedBlockManager {
    pub fn new(config: &CacheConfig) -> Self {
        let streaming = config.sp_attn_config.map(|sp_attn| {
            let sink_blocks = blocks_for(sp_attn.sink_size, config.block_size);
            let local_blocks = blocks_for(sp_attn.local_size, config.block_size);
            StreamingPool {
                pool: CachePool::new(
                    config.num_streaming_gpu_blocks,
                    config.num_streaming_cpu_blocks,
                ),
                max_blocks_per_seq: (sink_blocks + local_blocks).max(1),
            }
        });
        Self {
            block_size: config.block_size,
            retrieval: CachePool::new(
                config.num_retrieval_gpu_blocks,
                config.num_retrieval_cpu_blocks,
            ),
            streaming,
        }
    }

    /// Snapshot of free-block counts, mostly for logging and tests.
    pub fn usage(&self) -> BlockUsage {
        BlockUsage {
            free_retrieval_gpu_blocks: self.retrieval.gpu.num_free(),
            free_retrieval_cpu_blocks: self.retrieval.cpu.num_free(),
            free_streaming_gpu_blocks: self.streaming.as_ref().map(|s| s.pool.gpu.num_free()),
            free_streaming_cpu_blocks: self.streaming.as_ref().map(|s| s.pool.cpu.num_free()),
        }
    }

    /// Blocks the prompt of a waiting group requires in the retrieval class.
    fn required_blocks(
        &self,
        seq_group: &SequenceGroup,
        ifb_mode: bool,
        init_num_blocks: Option<usize>,
    ) -> usize {
        let prompt_len = seq_group
            .get_seqs(Some(SequenceStatus::Waiting))
            .first()
            .map(|seq| seq.len())
            .unwrap_or(0);
        let prompt_blocks = blocks_for(prompt_len, self.block_size);
        if ifb_mode {
            prompt_blocks
        } else {
            // Fixed up-front reservation covering prompt and generation.
            init_num_blocks.unwrap_or(prompt_blocks)
        }
    }

    fn seq_ids_with_status(seq_group: &SequenceGroup, status: SequenceStatus) -> Vec<SeqId> {
        seq_group
            .get_seqs(Some(status))
            .iter()
            .map(|seq| seq.id())
            .collect()
    }
}

impl BlockSpaceManager for PagedBlockManager {
    fn can_allocate(
        &self,
        seq_group: &SequenceGroup,
        ifb_mode: bool,
        init_num_blocks: Option<usize>,
    ) -> AllocStatus {
        let required = self.required_blocks(seq_group, ifb_mode, init_num_blocks);
        if required > self.retrieval.gpu.num_total() {
            return AllocStatus::Never;
        }
        let streaming_required = self
            .streaming
            .as_ref()
            .map(|s| (required.min(s.max_blocks_per_seq), s));
        if let Some((req, s)) = streaming_required {
            if req > s.pool.gpu.num_total() {
                return AllocStatus::Never;
            }
            if req > s.pool.gpu.num_free() {
                return AllocStatus::Later;
            }
        }
        if required > self.retrieval.gpu.num_free() {
            return AllocStatus::Later;
        }
        AllocStatus::Ok
    }

    fn allocate(&mut self, seq_group: &SequenceGroup, ifb_mode: bool, init_num_blocks: Option<usize>) {
        let required = self.required_blocks(seq_group, ifb_mode, init_num_blocks);
        let waiting = seq_group.get_seqs(Some(SequenceStatus::Waiting));
        assert_eq!(
            waiting.len(),
            1,
            "prompt allocation expects exactly one waiting sequence"
        );
        let seq_id = waiting[0].id();

        self.retrieval.allocate_table(seq_id, required);
        if let Some(streaming) = &mut self.streaming {
            let capped = required.min(streaming.max_blocks_per_seq);
            streaming.pool.allocate_table(seq_id, capped);
        }
        debug!(
            "allocated {} retrieval blocks for request {} (seq {})",
            required,
            seq_group.request_id(),
            seq_id
        );
    }

    fn can_append_slot(&self, seq_group: &SequenceGroup) -> bool {
        // Worst case: every running sequence crosses a block boundary.
        let num_running = seq_group.num_seqs(Some(SequenceStatus::Running));
        if self.retrieval.gpu.num_free() < num_running {
            return false;
        }
        self.streaming
            .as_ref()
            .map_or(true, |s| s.pool.gpu.num_free() >= num_running)
    }

    fn append_slot(&mut self, seq: &SeqHandle) -> (Option<CowPair>, Option<CowPair>) {
        let seq_id = seq.id();
        let target_len = seq.len() + 1;
        let retrieval_blocks = blocks_for(target_len, self.block_size);
        let retrieval_cow = self.retrieval.append_slot(seq_id, retrieval_blocks);
        let streaming_cow = self.streaming.as_mut().and_then(|s| {
            let capped = retrieval_blocks.min(s.max_blocks_per_seq);
            s.pool.append_slot(seq_id, capped)
        });
        (retrieval_cow, streaming_cow)
    }

    fn can_swap_in(&self, seq_group: &SequenceGroup) -> bool {
        let seq_ids = Self::seq_ids_with_status(seq_group, SequenceStatus::Swapped);
        // One headroom block per resumed sequence on top of the migrated set.
        let required = self.retrieval.distinct_blocks(&seq_ids, Device::Cpu) + seq_ids.len();
        if required > self.retrieval.gpu.num_free() {
            return false;
        }
        self.streaming.as_ref().map_or(true, |s| {
            s.pool.distinct_blocks(&seq_ids, Device::Cpu) + seq_ids.len()
                <= s.pool.gpu.num_free()
        })
    }

    fn swap_in(
        &mut self,
        seq_group: &SequenceGroup,
    ) -> (HashMap<BlockId, BlockId>, HashMap<BlockId, BlockId>) {
        let seq_ids = Self::seq_ids_with_status(seq_group, SequenceStatus::Swapped);
        let retrieval_mapping = self.retrieval.migrate(&seq_ids, Device::Cpu);
        let streaming_mapping = match &mut self.streaming {
            Some(s) => s.pool.migrate(&seq_ids, Device::Cpu),
            None => HashMap::new(),
        };
        debug!(
            "swapped in request {} ({} retrieval blocks)",
            seq_group.request_id(),
            retrieval_mapping.len()
        );
        (retrieval_mapping, streaming_mapping)
    }

    fn can_swap_out(&self, seq_group: &SequenceGroup) -> bool {
        let seq_ids = Self::seq_ids_with_status(seq_group, SequenceStatus::Running);
        if self.retrieval.distinct_blocks(&seq_ids, Device::Gpu) > self.retrieval.cpu.num_free() {
            return false;
        }
        self.streaming.as_ref().map_or(true, |s| {
            s.pool.distinct_blocks(&seq_ids, Device::Gpu) <= s.pool.cpu.num_free()
        })
    }

    fn swap_out(
        &mut self,
        seq_group: &SequenceGroup,
    ) -> (HashMap<BlockId, BlockId>, HashMap<BlockId, BlockId>) {
        let seq_ids = Self::seq_ids_with_status(seq_group, SequenceStatus::Running);
        let retrieval_mapping = self.retrieval.migrate(&seq_ids, Device::Gpu);
        let streaming_mapping = match &mut self.streaming {
            Some(s) => s.pool.migrate(&seq_ids, Device::Gpu),
            None => HashMap::new(),
        };
        debug!(
            "swapped out request {} ({} retrieval blocks)",
            seq_group.request_id(),
            retrieval_mapping.len()
        );
        (retrieval_mapping, streaming_mapping)
    }

    fn fork(&mut self, parent_seq: &SeqHandle, child_seq: &SeqHandle) {
        self.retrieval.fork(parent_seq.id(), child_seq.id());
        if let Some(streaming) = &mut self.streaming {
            streaming.pool.fork(parent_seq.id(), child_seq.id());
        }
    }

    fn free(&mut self, seq_id: SeqId) {
        self.retrieval.free_seq(seq_id);
        if let Some(streaming) = &mut self.streaming {
            streaming.pool.free_seq(seq_id);
        }
    }

    fn get_retrieval_block_table(&self, seq_id: SeqId) -> Vec<BlockId> {
        self.retrieval
            .tables
            .get(&seq_id)
            .map(|table| table.blocks.clone())
            .unwrap_or_default()
    }

    fn get_streaming_block_table(&self, seq_id: SeqId) -> Option<Vec<BlockId>> {
        let streaming = self.streaming.as_ref()?;
        Some(
            streaming
                .pool
                .tables
                .get(&seq_id)
                .map(|table| table.blocks.clone())
                .unwrap_or_default(),
        )
    }
}

/// Free-block counts per pool; `None` when the streaming class is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUsage {
    pub free_retrieval_gpu_blocks: usize,
    pub free_retrieval_cpu_blocks: usize,
    pub free_streaming_gpu_blocks: Option<usize>,
    pub free_streaming_cpu_blocks: Option<usize>,
}

fn blocks_for(num_tokens: usize, block_size: usize) -> usize {
    (num_tokens + block_size - 1) / block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpAttnConfig;
    use crate::sequence::{SamplingParams, SeqHandle, Sequence};
    use std::time::Instant;

    fn cache_config(block_size: usize, gpu: usize, cpu: usize) -> CacheConfig {
        CacheConfig {
            block_size,
            num_retrieval_gpu_blocks: gpu,
            num_retrieval_cpu_blocks: cpu,
            ..Default::default()
        }
    }

    fn waiting_group(request_id: &str, seq_id: SeqId, prompt_len: usize) -> SequenceGroup {
        let seq = SeqHandle::new(Sequence::new(seq_id, vec![1; prompt_len]));
        SequenceGroup::new(
            request_id.to_string(),
            vec![seq],
            SamplingParams::default(),
            Instant::now(),
            None,
        )
    }

    fn admit(manager: &mut PagedBlockManager, group: &SequenceGroup) -> SeqHandle {
        assert_eq!(manager.can_allocate(group, true, None), AllocStatus::Ok);
        manager.allocate(group, true, None);
        let seq = group.get_seqs(None).remove(0);
        seq.set_status(SequenceStatus::Running);
        seq
    }

    #[test]
    fn allocator_recycles_blocks_at_zero_refs() {
        let mut allocator = BlockAllocator::new(2);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(allocator.num_free(), 0);
        assert!(allocator.allocate().is_none());

        allocator.incr_ref(a);
        allocator.free(a);
        assert_eq!(allocator.num_free(), 0);
        allocator.free(a);
        assert_eq!(allocator.num_free(), 1);

        allocator.free(b);
        assert_eq!(allocator.num_free(), 2);
    }

    #[test]
    fn prompt_allocation_sizes_table_by_block_size() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 8, 8));
        let group = waiting_group("r0", 0, 10);
        let seq = admit(&mut manager, &group);

        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 3);
        assert_eq!(manager.usage().free_retrieval_gpu_blocks, 5);
        assert!(manager.get_streaming_block_table(seq.id()).is_none());
    }

    #[test]
    fn can_allocate_classifies_later_and_never() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 4, 4));

        // 40 tokens need 10 blocks and the pool only has 4.
        let too_big = waiting_group("big", 0, 40);
        assert_eq!(manager.can_allocate(&too_big, true, None), AllocStatus::Never);

        let first = waiting_group("first", 1, 12);
        admit(&mut manager, &first);
        let second = waiting_group("second", 2, 12);
        assert_eq!(manager.can_allocate(&second, true, None), AllocStatus::Later);
    }

    #[test]
    fn fixed_allocation_overrides_prompt_size() {
        let manager = PagedBlockManager::new(&cache_config(4, 8, 8));
        let group = waiting_group("r0", 0, 4);
        assert_eq!(manager.can_allocate(&group, false, Some(16)), AllocStatus::Never);
        assert_eq!(manager.can_allocate(&group, false, Some(6)), AllocStatus::Ok);
    }

    #[test]
    fn append_slot_grows_on_block_boundary() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 8, 8));
        let group = waiting_group("r0", 0, 4);
        let seq = admit(&mut manager, &group);
        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 1);

        // Token 5 starts a new block; no copy is needed for a fresh block.
        let (retrieval_cow, streaming_cow) = manager.append_slot(&seq);
        assert_eq!(retrieval_cow, None);
        assert_eq!(streaming_cow, None);
        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 2);

        // Token 6 lands in the unshared tail block.
        seq.append_token(9);
        let (retrieval_cow, _) = manager.append_slot(&seq);
        assert_eq!(retrieval_cow, None);
        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 2);
    }

    #[test]
    fn fork_then_append_copies_shared_tail() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 8, 8));
        let group = waiting_group("r0", 0, 6);
        let parent = admit(&mut manager, &group);

        let child = SeqHandle::new(parent.fork(1));
        group.add_seq(child.clone());
        manager.fork(&parent, &child);
        assert_eq!(
            manager.get_retrieval_block_table(parent.id()),
            manager.get_retrieval_block_table(child.id())
        );

        // The shared tail block must be cloned before the child writes.
        let (retrieval_cow, _) = manager.append_slot(&child);
        let (src, dst) = retrieval_cow.unwrap();
        assert_eq!(src, manager.get_retrieval_block_table(parent.id())[1]);
        assert_eq!(dst, manager.get_retrieval_block_table(child.id())[1]);

        // The parent's tail is exclusive again.
        let (retrieval_cow, _) = manager.append_slot(&parent);
        assert_eq!(retrieval_cow, None);
    }

    #[test]
    fn swap_round_trip_preserves_table_shape() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 8, 8));
        let group = waiting_group("r0", 0, 10);
        let seq = admit(&mut manager, &group);
        let gpu_table = manager.get_retrieval_block_table(seq.id());

        assert!(manager.can_swap_out(&group));
        let (gpu_to_cpu, _) = manager.swap_out(&group);
        seq.set_status(SequenceStatus::Swapped);
        assert_eq!(gpu_to_cpu.len(), 3);
        assert_eq!(manager.usage().free_retrieval_gpu_blocks, 8);
        assert_eq!(manager.usage().free_retrieval_cpu_blocks, 5);

        let cpu_table = manager.get_retrieval_block_table(seq.id());
        for (gpu_block, cpu_block) in gpu_table.iter().zip(&cpu_table) {
            assert_eq!(gpu_to_cpu[gpu_block], *cpu_block);
        }

        assert!(manager.can_swap_in(&group));
        let (cpu_to_gpu, _) = manager.swap_in(&group);
        seq.set_status(SequenceStatus::Running);
        assert_eq!(cpu_to_gpu.len(), 3);
        assert_eq!(manager.usage().free_retrieval_cpu_blocks, 8);
        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 3);
    }

    #[test]
    fn swap_out_refused_without_cpu_space() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 8, 1));
        let group = waiting_group("r0", 0, 10);
        admit(&mut manager, &group);
        assert!(!manager.can_swap_out(&group));
    }

    #[test]
    fn streaming_table_is_capped_by_sparse_layout() {
        let config = CacheConfig {
            block_size: 4,
            num_retrieval_gpu_blocks: 16,
            num_retrieval_cpu_blocks: 16,
            num_streaming_gpu_blocks: 16,
            num_streaming_cpu_blocks: 16,
            sp_attn_config: Some(SpAttnConfig {
                sink_size: 4,
                local_size: 4,
            }),
        };
        let mut manager = PagedBlockManager::new(&config);
        let group = waiting_group("r0", 0, 20);
        let seq = admit(&mut manager, &group);

        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 5);
        // Sink (1 block) + local window (1 block).
        assert_eq!(manager.get_streaming_block_table(seq.id()).unwrap().len(), 2);

        // Decoding grows the retrieval table but not the capped streaming one.
        let (_, streaming_cow) = manager.append_slot(&seq);
        assert_eq!(streaming_cow, None);
        assert_eq!(manager.get_retrieval_block_table(seq.id()).len(), 6);
        assert_eq!(manager.get_streaming_block_table(seq.id()).unwrap().len(), 2);
    }

    #[test]
    fn free_returns_blocks_and_forgets_the_sequence() {
        let mut manager = PagedBlockManager::new(&cache_config(4, 8, 8));
        let group = waiting_group("r0", 0, 10);
        let seq = admit(&mut manager, &group);
        assert_eq!(manager.usage().free_retrieval_gpu_blocks, 5);

        manager.free(seq.id());
        assert_eq!(manager.usage().free_retrieval_gpu_blocks, 8);
        assert!(manager.get_retrieval_block_table(seq.id()).is_empty());

        // Double free is a no-op.
        manager.free(seq.id());
        assert_eq!(manager.usage().free_retrieval_gpu_blocks, 8);
    }
}
