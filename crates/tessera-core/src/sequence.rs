//! Sequence and sequence-group data model observed by the scheduler.
//!
//! A `Sequence` is a single generation stream; a `SequenceGroup` is one
//! request, possibly fanning into several parallel sequences (e.g. beam
//! search). Groups sit in the scheduler queues behind `Arc` handles while
//! their sequence statuses flip, so sequences live behind a lock. Access is
//! single-owner: the engine serializes all scheduler calls.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::engine::types::{BlockId, RequestId, SeqId};

/// Lifecycle status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Swapped,
    FinishedStopped,
    FinishedAborted,
    FinishedIgnored,
}

impl SequenceStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::FinishedStopped | Self::FinishedAborted | Self::FinishedIgnored
        )
    }
}

/// Token data of a sequence: the prompt plus everything generated so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceData {
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
}

impl SequenceData {
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            output_token_ids: Vec::new(),
        }
    }

    /// Current token count, prompt and output combined.
    pub fn len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }
}

/// A single generation stream.
#[derive(Debug)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub status: SequenceStatus,
    pub data: SequenceData,
}

impl Sequence {
    pub fn new(seq_id: SeqId, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            seq_id,
            status: SequenceStatus::Waiting,
            data: SequenceData::new(prompt_token_ids),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

/// Shared handle to a sequence.
#[derive(Debug, Clone)]
pub struct SeqHandle(Arc<RwLock<Sequence>>);

impl SeqHandle {
    pub fn new(seq: Sequence) -> Self {
        Self(Arc::new(RwLock::new(seq)))
    }

    pub fn id(&self) -> SeqId {
        self.read().seq_id
    }

    pub fn status(&self) -> SequenceStatus {
        self.read().status
    }

    pub fn set_status(&self, status: SequenceStatus) {
        self.write().status = status;
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.read().is_finished()
    }

    pub fn prompt_len(&self) -> usize {
        self.read().data.prompt_len()
    }

    pub fn append_token(&self, token_id: u32) {
        self.write().data.append_token(token_id);
    }

    /// Copy of the sequence's token data, as recorded into step metadata.
    pub fn data_snapshot(&self) -> SequenceData {
        self.read().data.clone()
    }

    /// A new sequence continuing this one's data, used for beam fan-out.
    pub fn fork(&self, child_id: SeqId) -> Sequence {
        let guard = self.read();
        Sequence {
            seq_id: child_id,
            status: guard.status,
            data: guard.data.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Sequence> {
        self.0.read().expect("sequence lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sequence> {
        self.0.write().expect("sequence lock poisoned")
    }
}

/// Sampling parameters of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of output sequences to return
    pub n: usize,
    /// Number of candidate sequences generated while sampling
    pub best_of: usize,
    pub use_beam_search: bool,
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            best_of: 1,
            use_beam_search: false,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            max_tokens: 256,
        }
    }
}

/// Cached shared prompt prefix. The scheduler only passes the handle
/// through to execution metadata.
#[derive(Debug, Clone)]
pub struct Prefix {
    token_ids: Vec<u32>,
}

impl Prefix {
    pub fn new(token_ids: Vec<u32>) -> Self {
        Self { token_ids }
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }
}

/// A request: one or more sequences sampled from the same prompt.
#[derive(Debug)]
pub struct SequenceGroup {
    request_id: RequestId,
    seqs: RwLock<Vec<SeqHandle>>,
    sampling_params: SamplingParams,
    arrival_time: Instant,
    prefix: Option<Arc<Prefix>>,
}

impl SequenceGroup {
    pub fn new(
        request_id: RequestId,
        seqs: Vec<SeqHandle>,
        sampling_params: SamplingParams,
        arrival_time: Instant,
        prefix: Option<Arc<Prefix>>,
    ) -> Self {
        Self {
            request_id,
            seqs: RwLock::new(seqs),
            sampling_params,
            arrival_time,
            prefix,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn prefix(&self) -> Option<Arc<Prefix>> {
        self.prefix.clone()
    }

    /// Register a sequence forked into this group.
    pub fn add_seq(&self, seq: SeqHandle) {
        self.seqs_mut().push(seq);
    }

    /// Sequences in the group, optionally restricted to one status.
    pub fn get_seqs(&self, status: Option<SequenceStatus>) -> Vec<SeqHandle> {
        self.seqs()
            .iter()
            .filter(|seq| status.map_or(true, |s| seq.status() == s))
            .cloned()
            .collect()
    }

    pub fn find(&self, seq_id: SeqId) -> Option<SeqHandle> {
        self.seqs().iter().find(|seq| seq.id() == seq_id).cloned()
    }

    pub fn num_seqs(&self, status: Option<SequenceStatus>) -> usize {
        self.get_seqs(status).len()
    }

    pub fn num_unfinished_seqs(&self) -> usize {
        self.seqs().iter().filter(|seq| !seq.is_finished()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.seqs().iter().all(|seq| seq.is_finished())
    }

    /// Upper bound on how many of this group's sequences can run at once.
    pub fn get_max_num_running_seqs(&self) -> usize {
        if self.sampling_params.use_beam_search {
            self.sampling_params.best_of
        } else if self.sampling_params.best_of > self.num_seqs(None) {
            // The group has not fanned out yet; reserve a slot per candidate.
            self.sampling_params.best_of
        } else {
            self.num_unfinished_seqs()
        }
    }

    fn seqs(&self) -> std::sync::RwLockReadGuard<'_, Vec<SeqHandle>> {
        self.seqs.read().expect("sequence group lock poisoned")
    }

    fn seqs_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<SeqHandle>> {
        self.seqs.write().expect("sequence group lock poisoned")
    }
}

/// Per-group execution metadata handed to the model executor for one step.
///
/// Block tables are present for `schedule()` ticks and left empty by
/// `prepare_input()`.
#[derive(Debug, Clone)]
pub struct SequenceGroupMetadata {
    pub request_id: RequestId,
    pub is_prompt: bool,
    pub seq_data: HashMap<SeqId, SequenceData>,
    pub retrieval_block_tables: HashMap<SeqId, Vec<BlockId>>,
    pub streaming_block_tables: HashMap<SeqId, Option<Vec<BlockId>>>,
    pub sampling_params: SamplingParams,
    pub prefix: Option<Arc<Prefix>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with_prompt(len: usize, params: SamplingParams) -> SequenceGroup {
        let seq = SeqHandle::new(Sequence::new(0, vec![1; len]));
        SequenceGroup::new("req-0".to_string(), vec![seq], params, Instant::now(), None)
    }

    #[test]
    fn sequence_length_tracks_output() {
        let seq = SeqHandle::new(Sequence::new(3, vec![1, 2, 3]));
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.prompt_len(), 3);
        seq.append_token(7);
        assert_eq!(seq.len(), 4);
        assert_eq!(seq.data_snapshot().output_token_ids(), &[7]);
    }

    #[test]
    fn status_transitions() {
        let seq = SeqHandle::new(Sequence::new(0, vec![1]));
        assert_eq!(seq.status(), SequenceStatus::Waiting);
        assert!(!seq.is_finished());
        seq.set_status(SequenceStatus::FinishedAborted);
        assert!(seq.is_finished());
    }

    #[test]
    fn max_running_seqs_single() {
        let group = group_with_prompt(4, SamplingParams::default());
        assert_eq!(group.get_max_num_running_seqs(), 1);
    }

    #[test]
    fn max_running_seqs_before_and_after_fan_out() {
        let params = SamplingParams {
            best_of: 4,
            ..Default::default()
        };
        let group = group_with_prompt(4, params);
        // Not fanned out yet: reserve room for every candidate.
        assert_eq!(group.get_max_num_running_seqs(), 4);

        let parent = group.get_seqs(None).remove(0);
        for child_id in 1..4 {
            group.add_seq(SeqHandle::new(parent.fork(child_id)));
        }
        assert_eq!(group.get_max_num_running_seqs(), 4);

        group.find(3).unwrap().set_status(SequenceStatus::FinishedStopped);
        assert_eq!(group.get_max_num_running_seqs(), 3);
    }

    #[test]
    fn beam_search_reserves_best_of() {
        let params = SamplingParams {
            best_of: 4,
            use_beam_search: true,
            ..Default::default()
        };
        let group = group_with_prompt(4, params);
        assert_eq!(group.get_max_num_running_seqs(), 4);
    }

    #[test]
    fn group_finishes_when_all_seqs_finish() {
        let group = group_with_prompt(2, SamplingParams::default());
        assert!(!group.is_finished());
        for seq in group.get_seqs(None) {
            seq.set_status(SequenceStatus::FinishedStopped);
        }
        assert!(group.is_finished());
        assert_eq!(group.num_unfinished_seqs(), 0);
    }
}
