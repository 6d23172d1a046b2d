//! Error types for the Tessera scheduling engine

use thiserror::Error;

use crate::engine::types::RequestId;

#[derive(Error, Debug)]
pub enum Error {
    /// Raised when a preempted group cannot be swapped out because the CPU
    /// swap space is exhausted. The engine cannot recover; the swap space
    /// has to be enlarged.
    #[error(
        "aborted request {request_id}: not enough CPU swap space; \
         increase the swap space to avoid this error"
    )]
    SwapSpaceExhausted { request_id: RequestId },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
