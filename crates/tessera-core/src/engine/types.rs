//! Shared identifier types for the engine.

/// Physical KV-cache block index.
pub type BlockId = usize;

/// Stable identifier of a single generation stream.
pub type SeqId = u64;

/// Stable identifier of a request (sequence group).
pub type RequestId = String;
