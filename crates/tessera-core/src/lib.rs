//! Tessera Core - request scheduling for batched token generation
//!
//! This crate provides the scheduling core of a token-generation serving
//! engine that shares a finite two-tier KV cache across many concurrent
//! requests.
//!
//! # Architecture
//!
//! - Three-queue scheduling (waiting / running / swapped) with an FCFS policy
//! - Paged block management for the retrieval and streaming cache classes
//! - Preemption by recomputation or CPU swap under cache pressure
//! - A self-describing block-movement plan emitted on every step
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::{PagedBlockManager, Scheduler, TesseraConfig};
//!
//! let config = TesseraConfig::default();
//! let block_manager = PagedBlockManager::new(&config.cache);
//! let mut scheduler = Scheduler::new(config.scheduler, config.ifb, block_manager);
//!
//! scheduler.add_seq_group(seq_group);
//! let (metadata_list, outputs) = scheduler.schedule()?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod sequence;

pub use config::{CacheConfig, IFBConfig, SchedulerConfig, SpAttnConfig, TesseraConfig};
pub use engine::{
    AllocStatus, BlockId, BlockSpaceManager, BlockUsage, PagedBlockManager, Policy,
    PreemptionMode, RequestId, Scheduler, SchedulerOutputs, SchedulingPolicy, SeqId,
};
pub use error::{Error, Result};
pub use sequence::{
    Prefix, SamplingParams, SeqHandle, Sequence, SequenceData, SequenceGroup,
    SequenceGroupMetadata, SequenceStatus,
};
