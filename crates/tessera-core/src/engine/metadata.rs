//! Construction of per-group execution metadata for a scheduled step.

use std::collections::HashMap;

use crate::engine::block_manager::BlockSpaceManager;
use crate::engine::scheduler::SchedulerOutputs;
use crate::sequence::{SequenceGroupMetadata, SequenceStatus};

/// Builds one metadata record per scheduled group, restricted to the
/// sequences that will actually run this step.
///
/// With `block_manager` set the records carry the per-sequence block tables;
/// `None` produces accounting-only metadata with the tables omitted.
pub(crate) fn build_metadata<B: BlockSpaceManager>(
    block_manager: Option<&B>,
    scheduler_outputs: &SchedulerOutputs,
) -> Vec<SequenceGroupMetadata> {
    let mut metadata_list = Vec::with_capacity(scheduler_outputs.scheduled_seq_groups.len());
    for seq_group in &scheduler_outputs.scheduled_seq_groups {
        let mut seq_data = HashMap::new();
        let mut retrieval_block_tables = HashMap::new();
        let mut streaming_block_tables = HashMap::new();
        for seq in seq_group.get_seqs(Some(SequenceStatus::Running)) {
            let seq_id = seq.id();
            seq_data.insert(seq_id, seq.data_snapshot());
            if let Some(manager) = block_manager {
                retrieval_block_tables.insert(seq_id, manager.get_retrieval_block_table(seq_id));
                streaming_block_tables.insert(seq_id, manager.get_streaming_block_table(seq_id));
            }
        }
        metadata_list.push(SequenceGroupMetadata {
            request_id: seq_group.request_id().clone(),
            is_prompt: scheduler_outputs.prompt_run,
            seq_data,
            retrieval_block_tables,
            streaming_block_tables,
            sampling_params: seq_group.sampling_params().clone(),
            prefix: seq_group.prefix(),
        });
    }
    metadata_list
}
