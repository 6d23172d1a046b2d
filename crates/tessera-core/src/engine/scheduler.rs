//! Request scheduler for batched token generation.
//!
//! The scheduler decides, on every engine step, which requests advance,
//! which newly arrived requests join the batch, which are preempted to free
//! cache, and which previously preempted requests resume. It manages:
//! - Waiting queue (new requests awaiting prompt admission)
//! - Running queue (requests in the decode phase)
//! - Swapped queue (requests whose cache was moved to CPU)
//! - Token-budget and sequence-count limits
//! - The block-movement plan the executor applies before each step

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{IFBConfig, SchedulerConfig};
use crate::engine::block_manager::{AllocStatus, BlockSpaceManager};
use crate::engine::metadata::build_metadata;
use crate::engine::policy::{make_policy, Policy};
use crate::engine::types::{BlockId, RequestId};
use crate::error::{Error, Result};
use crate::sequence::{SeqHandle, SequenceGroup, SequenceGroupMetadata, SequenceStatus};

/// How a preempted group gives its cache back.
///
/// Swapping moves the group's blocks to CPU memory and back on resume.
/// Recomputation drops the blocks and replays the request as a fresh
/// prompt; it is only defined for single-sequence groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionMode {
    Swap,
    Recompute,
}

type SwapMap = HashMap<BlockId, BlockId>;
type CopyMap = HashMap<BlockId, Vec<BlockId>>;

/// Immutable plan record for one scheduled step.
#[derive(Debug)]
pub struct SchedulerOutputs {
    /// Groups that will execute this step, in batch order.
    pub scheduled_seq_groups: Vec<Arc<SequenceGroup>>,
    /// True for a prompt-admission step, false for a decode step.
    pub prompt_run: bool,
    /// For prompt runs the padded rectangle `count * max_prompt_len`; for
    /// decode runs the number of running sequences.
    pub num_batched_tokens: usize,
    pub retrieval_blocks_to_swap_in: SwapMap,
    pub streaming_blocks_to_swap_in: SwapMap,
    pub retrieval_blocks_to_swap_out: SwapMap,
    pub streaming_blocks_to_swap_out: SwapMap,
    pub retrieval_blocks_to_copy: CopyMap,
    pub streaming_blocks_to_copy: CopyMap,
    /// Groups rejected at admission, already marked `FinishedIgnored`.
    pub ignored_seq_groups: Vec<Arc<SequenceGroup>>,
}

impl SchedulerOutputs {
    #[allow(clippy::too_many_arguments)]
    fn new(
        scheduled_seq_groups: Vec<Arc<SequenceGroup>>,
        prompt_run: bool,
        num_batched_tokens: usize,
        retrieval_blocks_to_swap_in: SwapMap,
        streaming_blocks_to_swap_in: SwapMap,
        retrieval_blocks_to_swap_out: SwapMap,
        streaming_blocks_to_swap_out: SwapMap,
        retrieval_blocks_to_copy: CopyMap,
        streaming_blocks_to_copy: CopyMap,
        ignored_seq_groups: Vec<Arc<SequenceGroup>>,
    ) -> Self {
        // Swap in and swap out never happen in the same step.
        assert!(
            retrieval_blocks_to_swap_in.is_empty() || retrieval_blocks_to_swap_out.is_empty(),
            "retrieval swap-in and swap-out scheduled in the same step"
        );
        assert!(
            streaming_blocks_to_swap_in.is_empty() || streaming_blocks_to_swap_out.is_empty(),
            "streaming swap-in and swap-out scheduled in the same step"
        );
        Self {
            scheduled_seq_groups,
            prompt_run,
            num_batched_tokens,
            retrieval_blocks_to_swap_in,
            streaming_blocks_to_swap_in,
            retrieval_blocks_to_swap_out,
            streaming_blocks_to_swap_out,
            retrieval_blocks_to_copy,
            streaming_blocks_to_copy,
            ignored_seq_groups,
        }
    }

    /// Whether the executor has any work or block movement to perform.
    /// Ignored groups do not count as work.
    pub fn is_empty(&self) -> bool {
        self.scheduled_seq_groups.is_empty()
            && self.retrieval_blocks_to_swap_in.is_empty()
            && self.streaming_blocks_to_swap_in.is_empty()
            && self.retrieval_blocks_to_swap_out.is_empty()
            && self.streaming_blocks_to_swap_out.is_empty()
            && self.retrieval_blocks_to_copy.is_empty()
            && self.streaming_blocks_to_copy.is_empty()
    }
}

/// The three-queue scheduling state machine.
///
/// All calls must be externally serialized; one tick runs to completion on
/// a consistent snapshot of the queues and the block manager.
pub struct Scheduler<B: BlockSpaceManager> {
    scheduler_config: SchedulerConfig,
    ifb_mode: bool,
    /// Fixed allocation size used outside IFB mode.
    init_num_blocks: Option<usize>,
    prompt_limit: usize,
    policy: Box<dyn Policy>,
    block_manager: B,
    /// Sequence groups awaiting prompt admission.
    waiting: VecDeque<Arc<SequenceGroup>>,
    /// Sequence groups in the decode phase.
    running: VecDeque<Arc<SequenceGroup>>,
    /// Sequence groups whose cache lives in CPU swap space.
    swapped: VecDeque<Arc<SequenceGroup>>,
}

impl<B: BlockSpaceManager> Scheduler<B> {
    pub fn new(scheduler_config: SchedulerConfig, ifb_config: IFBConfig, block_manager: B) -> Self {
        let prompt_limit = scheduler_config.prompt_limit();
        let policy = make_policy(scheduler_config.policy);
        Self {
            scheduler_config,
            ifb_mode: ifb_config.ifb_mode,
            init_num_blocks: None,
            prompt_limit,
            policy,
            block_manager,
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
        }
    }

    pub fn block_manager(&self) -> &B {
        &self.block_manager
    }

    /// Append a request to the waiting queue. Admission happens on a later
    /// tick.
    pub fn add_seq_group(&mut self, seq_group: Arc<SequenceGroup>) {
        debug!("queued request {}", seq_group.request_id());
        self.waiting.push_back(seq_group);
    }

    /// Abort the requests with the given ids wherever they are queued,
    /// freeing every still-live sequence. Unknown ids are ignored.
    pub fn abort_seq_group<I>(&mut self, request_ids: I)
    where
        I: IntoIterator<Item = RequestId>,
    {
        let mut request_ids: HashSet<RequestId> = request_ids.into_iter().collect();
        for queue in [&mut self.waiting, &mut self.running, &mut self.swapped] {
            let mut aborted_groups: Vec<Arc<SequenceGroup>> = Vec::new();
            for seq_group in queue.iter() {
                if request_ids.is_empty() {
                    // May leave a couple of extra scans behind, but keeps
                    // the loop simple.
                    break;
                }
                if request_ids.remove(seq_group.request_id()) {
                    aborted_groups.push(Arc::clone(seq_group));
                }
            }
            for aborted_group in aborted_groups {
                queue.retain(|g| !Arc::ptr_eq(g, &aborted_group));
                for seq in aborted_group.get_seqs(None) {
                    if seq.is_finished() {
                        continue;
                    }
                    seq.set_status(SequenceStatus::FinishedAborted);
                    self.block_manager.free(seq.id());
                }
                debug!("aborted request {}", aborted_group.request_id());
            }
        }
    }

    pub fn has_unfinished_seqs(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    pub fn get_num_unfinished_seq_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len()
    }

    /// Set the fixed allocation size used outside IFB mode.
    pub fn update_init_num_blocks(&mut self, init_num_blocks: usize) {
        self.init_num_blocks = Some(init_num_blocks);
    }

    pub fn fork_seq(&mut self, parent_seq: &SeqHandle, child_seq: &SeqHandle) {
        self.block_manager.fork(parent_seq, child_seq);
    }

    pub fn free_seq(&mut self, seq: &SeqHandle) {
        self.block_manager.free(seq.id());
    }

    /// Drop finished groups from the running queue.
    pub fn free_finished_seq_groups(&mut self) {
        self.running.retain(|seq_group| !seq_group.is_finished());
    }

    /// Run one tick and build full execution metadata, block tables
    /// included.
    pub fn schedule(&mut self) -> Result<(Vec<SequenceGroupMetadata>, SchedulerOutputs)> {
        let scheduler_outputs = self.schedule_inner()?;
        let metadata_list = build_metadata(Some(&self.block_manager), &scheduler_outputs);
        Ok((metadata_list, scheduler_outputs))
    }

    /// Same tick logic as [`schedule`](Self::schedule), but the metadata
    /// carries no block tables. Used for warmup and accounting-only steps.
    pub fn prepare_input(&mut self) -> Result<(Vec<SequenceGroupMetadata>, SchedulerOutputs)> {
        let scheduler_outputs = self.schedule_inner()?;
        let metadata_list = build_metadata::<B>(None, &scheduler_outputs);
        Ok((metadata_list, scheduler_outputs))
    }

    fn schedule_inner(&mut self) -> Result<SchedulerOutputs> {
        // Blocks to swap or copy before the model executes this step.
        let mut retrieval_blocks_to_swap_in: SwapMap = HashMap::new();
        let mut streaming_blocks_to_swap_in: SwapMap = HashMap::new();
        let mut retrieval_blocks_to_swap_out: SwapMap = HashMap::new();
        let mut streaming_blocks_to_swap_out: SwapMap = HashMap::new();
        let mut retrieval_blocks_to_copy: CopyMap = HashMap::new();
        let mut streaming_blocks_to_copy: CopyMap = HashMap::new();

        let now = Instant::now();

        // Join waiting sequences if nothing is swapped out.
        if self.swapped.is_empty() {
            let mut ignored_seq_groups: Vec<Arc<SequenceGroup>> = Vec::new();
            let mut scheduled: Vec<Arc<SequenceGroup>> = Vec::new();
            // Sequences on the fly, including those in the generation phase.
            let mut num_curr_seqs: usize = self
                .running
                .iter()
                .map(|seq_group| seq_group.get_max_num_running_seqs())
                .sum();
            let mut seq_lens: Vec<usize> = Vec::new();

            // The waiting queue is never re-sorted: preempted groups rejoin
            // at the front and new arrivals append at the back.
            while let Some(seq_group) = self.waiting.front().cloned() {
                let waiting_seqs = seq_group.get_seqs(Some(SequenceStatus::Waiting));
                assert_eq!(
                    waiting_seqs.len(),
                    1,
                    "waiting sequence group should have exactly one prompt sequence"
                );
                let num_prompt_tokens = waiting_seqs[0].len();
                if num_prompt_tokens > self.prompt_limit {
                    warn!(
                        "input prompt ({} tokens) is too long and exceeds limit of {}",
                        num_prompt_tokens, self.prompt_limit
                    );
                    for seq in &waiting_seqs {
                        seq.set_status(SequenceStatus::FinishedIgnored);
                    }
                    ignored_seq_groups.push(Arc::clone(&seq_group));
                    self.waiting.pop_front();
                    continue;
                }

                match self
                    .block_manager
                    .can_allocate(&seq_group, self.ifb_mode, self.init_num_blocks)
                {
                    AllocStatus::Later => break,
                    AllocStatus::Never => {
                        warn!(
                            "input prompt ({} tokens) is too long and exceeds the block \
                             manager's capacity",
                            num_prompt_tokens
                        );
                        for seq in &waiting_seqs {
                            seq.set_status(SequenceStatus::FinishedIgnored);
                        }
                        ignored_seq_groups.push(Arc::clone(&seq_group));
                        self.waiting.pop_front();
                        continue;
                    }
                    AllocStatus::Ok => {}
                }

                // The budget check uses the summed prompt lengths.
                let num_batched_tokens: usize =
                    seq_lens.iter().sum::<usize>() + num_prompt_tokens;
                if num_batched_tokens > self.scheduler_config.max_num_batched_tokens {
                    break;
                }

                // Running sequences must stay within the configured cap.
                let num_new_seqs = seq_group.get_max_num_running_seqs();
                if num_curr_seqs + num_new_seqs > self.scheduler_config.max_num_seqs {
                    break;
                }

                seq_lens.push(num_prompt_tokens);
                self.waiting.pop_front();
                self.allocate_group(&seq_group);
                self.running.push_back(Arc::clone(&seq_group));
                num_curr_seqs += num_new_seqs;
                scheduled.push(seq_group);
            }

            if !scheduled.is_empty() || !ignored_seq_groups.is_empty() {
                // Prompt batches are padded to a rectangle; report that cost.
                let num_batched_tokens =
                    seq_lens.len() * seq_lens.iter().copied().max().unwrap_or(0);
                return Ok(SchedulerOutputs::new(
                    scheduled,
                    true,
                    num_batched_tokens,
                    retrieval_blocks_to_swap_in,
                    streaming_blocks_to_swap_in,
                    retrieval_blocks_to_swap_out,
                    streaming_blocks_to_swap_out,
                    retrieval_blocks_to_copy,
                    streaming_blocks_to_copy,
                    ignored_seq_groups,
                ));
            }
        }

        // Preemption happens only when there is no slot left to keep every
        // running group growing; the policy decides the victims.
        self.policy.sort_by_priority(now, &mut self.running);

        // Reserve a new token slot for every running sequence group.
        let mut running: VecDeque<Arc<SequenceGroup>> = VecDeque::new();
        let mut preempted: Vec<Arc<SequenceGroup>> = Vec::new();
        while let Some(seq_group) = self.running.pop_front() {
            let mut preempted_self = false;
            while !self.block_manager.can_append_slot(&seq_group) {
                if let Some(victim_seq_group) = self.running.pop_back() {
                    // Evict the lowest-priority group first.
                    self.preempt(
                        &victim_seq_group,
                        &mut retrieval_blocks_to_swap_out,
                        &mut streaming_blocks_to_swap_out,
                        None,
                    )?;
                    preempted.push(victim_seq_group);
                } else {
                    // No other group can be evicted; preempt this one.
                    self.preempt(
                        &seq_group,
                        &mut retrieval_blocks_to_swap_out,
                        &mut streaming_blocks_to_swap_out,
                        None,
                    )?;
                    preempted.push(Arc::clone(&seq_group));
                    preempted_self = true;
                    break;
                }
            }
            if !preempted_self {
                self.append_slots(
                    &seq_group,
                    &mut retrieval_blocks_to_copy,
                    &mut streaming_blocks_to_copy,
                );
                running.push_back(seq_group);
            }
        }
        self.running = running;

        // Resume swapped-out groups, but never on a tick that preempted.
        if preempted.is_empty() {
            self.policy.sort_by_priority(now, &mut self.swapped);
            let mut num_curr_seqs: usize = self
                .running
                .iter()
                .map(|seq_group| seq_group.get_max_num_running_seqs())
                .sum();
            while let Some(seq_group) = self.swapped.front().cloned() {
                if !self.block_manager.can_swap_in(&seq_group) {
                    break;
                }
                let num_new_seqs = seq_group.get_max_num_running_seqs();
                if num_curr_seqs + num_new_seqs > self.scheduler_config.max_num_seqs {
                    break;
                }
                self.swapped.pop_front();
                self.swap_in_group(
                    &seq_group,
                    &mut retrieval_blocks_to_swap_in,
                    &mut streaming_blocks_to_swap_in,
                );
                self.append_slots(
                    &seq_group,
                    &mut retrieval_blocks_to_copy,
                    &mut streaming_blocks_to_copy,
                );
                num_curr_seqs += num_new_seqs;
                self.running.push_back(seq_group);
            }
        }

        // Each decoding sequence advances by exactly one token.
        let num_batched_tokens: usize = self
            .running
            .iter()
            .map(|seq_group| seq_group.num_seqs(Some(SequenceStatus::Running)))
            .sum();

        Ok(SchedulerOutputs::new(
            self.running.iter().cloned().collect(),
            false,
            num_batched_tokens,
            retrieval_blocks_to_swap_in,
            streaming_blocks_to_swap_in,
            retrieval_blocks_to_swap_out,
            streaming_blocks_to_swap_out,
            retrieval_blocks_to_copy,
            streaming_blocks_to_copy,
            Vec::new(),
        ))
    }

    fn allocate_group(&mut self, seq_group: &SequenceGroup) {
        self.block_manager
            .allocate(seq_group, self.ifb_mode, self.init_num_blocks);
        for seq in seq_group.get_seqs(Some(SequenceStatus::Waiting)) {
            seq.set_status(SequenceStatus::Running);
        }
    }

    fn append_slots(
        &mut self,
        seq_group: &SequenceGroup,
        retrieval_blocks_to_copy: &mut CopyMap,
        streaming_blocks_to_copy: &mut CopyMap,
    ) {
        for seq in seq_group.get_seqs(Some(SequenceStatus::Running)) {
            let (retrieval_cow, streaming_cow) = self.block_manager.append_slot(&seq);
            if let Some((src_block, dst_block)) = retrieval_cow {
                retrieval_blocks_to_copy
                    .entry(src_block)
                    .or_default()
                    .push(dst_block);
            }
            if let Some((src_block, dst_block)) = streaming_cow {
                streaming_blocks_to_copy
                    .entry(src_block)
                    .or_default()
                    .push(dst_block);
            }
        }
    }

    fn preempt(
        &mut self,
        seq_group: &Arc<SequenceGroup>,
        retrieval_blocks_to_swap_out: &mut SwapMap,
        streaming_blocks_to_swap_out: &mut SwapMap,
        preemption_mode: Option<PreemptionMode>,
    ) -> Result<()> {
        // Recomputation is only defined for single-sequence groups; groups
        // with several sequences (e.g. beam search) swap instead.
        let mode = preemption_mode.unwrap_or_else(|| {
            if seq_group.get_max_num_running_seqs() == 1 {
                PreemptionMode::Recompute
            } else {
                PreemptionMode::Swap
            }
        });
        debug!("preempting request {} ({:?})", seq_group.request_id(), mode);
        match mode {
            PreemptionMode::Recompute => {
                self.preempt_by_recompute(seq_group);
                Ok(())
            }
            PreemptionMode::Swap => self.preempt_by_swap(
                seq_group,
                retrieval_blocks_to_swap_out,
                streaming_blocks_to_swap_out,
            ),
        }
    }

    fn preempt_by_recompute(&mut self, seq_group: &Arc<SequenceGroup>) {
        let seqs = seq_group.get_seqs(Some(SequenceStatus::Running));
        assert_eq!(
            seqs.len(),
            1,
            "recompute preemption requires a single running sequence"
        );
        for seq in &seqs {
            seq.set_status(SequenceStatus::Waiting);
            self.block_manager.free(seq.id());
        }
        // Preempted groups go before fresh arrivals.
        self.waiting.push_front(Arc::clone(seq_group));
    }

    fn preempt_by_swap(
        &mut self,
        seq_group: &Arc<SequenceGroup>,
        retrieval_blocks_to_swap_out: &mut SwapMap,
        streaming_blocks_to_swap_out: &mut SwapMap,
    ) -> Result<()> {
        self.swap_out_group(
            seq_group,
            retrieval_blocks_to_swap_out,
            streaming_blocks_to_swap_out,
        )?;
        self.swapped.push_back(Arc::clone(seq_group));
        Ok(())
    }

    fn swap_in_group(
        &mut self,
        seq_group: &SequenceGroup,
        retrieval_blocks_to_swap_in: &mut SwapMap,
        streaming_blocks_to_swap_in: &mut SwapMap,
    ) {
        let (retrieval_mapping, streaming_mapping) = self.block_manager.swap_in(seq_group);
        retrieval_blocks_to_swap_in.extend(retrieval_mapping);
        streaming_blocks_to_swap_in.extend(streaming_mapping);
        for seq in seq_group.get_seqs(Some(SequenceStatus::Swapped)) {
            seq.set_status(SequenceStatus::Running);
        }
    }

    fn swap_out_group(
        &mut self,
        seq_group: &SequenceGroup,
        retrieval_blocks_to_swap_out: &mut SwapMap,
        streaming_blocks_to_swap_out: &mut SwapMap,
    ) -> Result<()> {
        if !self.block_manager.can_swap_out(seq_group) {
            return Err(Error::SwapSpaceExhausted {
                request_id: seq_group.request_id().clone(),
            });
        }
        let (retrieval_mapping, streaming_mapping) = self.block_manager.swap_out(seq_group);
        retrieval_blocks_to_swap_out.extend(retrieval_mapping);
        streaming_blocks_to_swap_out.extend(streaming_mapping);
        for seq in seq_group.get_seqs(Some(SequenceStatus::Running)) {
            seq.set_status(SequenceStatus::Swapped);
        }
        Ok(())
    }
}
