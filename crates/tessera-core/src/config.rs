//! Configuration types for the Tessera scheduling engine

use serde::{Deserialize, Serialize};

use crate::engine::policy::SchedulingPolicy;
use crate::error::{Error, Result};

/// Scheduler limits and policy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum model context length in tokens; upper bound for a prompt
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Token budget per scheduled batch
    #[serde(default = "default_max_num_batched_tokens")]
    pub max_num_batched_tokens: usize,

    /// Maximum number of concurrently running sequences
    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: usize,

    /// Queue ordering policy
    #[serde(default)]
    pub policy: SchedulingPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_model_len: default_max_model_len(),
            max_num_batched_tokens: default_max_num_batched_tokens(),
            max_num_seqs: default_max_num_seqs(),
            policy: SchedulingPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Upper bound for an admissible prompt.
    pub fn prompt_limit(&self) -> usize {
        self.max_model_len.min(self.max_num_batched_tokens)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_model_len == 0 {
            return Err(Error::Config("max_model_len must be positive".into()));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(Error::Config(
                "max_num_batched_tokens must be positive".into(),
            ));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be positive".into()));
        }
        Ok(())
    }
}

fn default_max_model_len() -> usize {
    4096
}

fn default_max_num_batched_tokens() -> usize {
    2048
}

fn default_max_num_seqs() -> usize {
    256
}

/// Sparse-attention layout for the streaming KV class.
///
/// Opaque to the scheduler; the block manager uses it to bound the number
/// of streaming blocks a sequence may hold (attention sinks plus a local
/// window).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpAttnConfig {
    /// Attention-sink span in tokens
    pub sink_size: usize,
    /// Local-window span in tokens
    pub local_size: usize,
}

/// Capacity of the two-tier, two-class KV cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per cache block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Retrieval-class blocks resident on the GPU
    #[serde(default = "default_num_retrieval_gpu_blocks")]
    pub num_retrieval_gpu_blocks: usize,

    /// Retrieval-class blocks reserved in CPU swap space
    #[serde(default = "default_num_retrieval_cpu_blocks")]
    pub num_retrieval_cpu_blocks: usize,

    /// Streaming-class blocks resident on the GPU
    #[serde(default)]
    pub num_streaming_gpu_blocks: usize,

    /// Streaming-class blocks reserved in CPU swap space
    #[serde(default)]
    pub num_streaming_cpu_blocks: usize,

    /// Sparse-attention layout; enables the streaming class when present
    #[serde(default)]
    pub sp_attn_config: Option<SpAttnConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            num_retrieval_gpu_blocks: default_num_retrieval_gpu_blocks(),
            num_retrieval_cpu_blocks: default_num_retrieval_cpu_blocks(),
            num_streaming_gpu_blocks: 0,
            num_streaming_cpu_blocks: 0,
            sp_attn_config: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if self.num_retrieval_gpu_blocks == 0 {
            return Err(Error::Config(
                "num_retrieval_gpu_blocks must be positive".into(),
            ));
        }
        if self.sp_attn_config.is_some() {
            if self.num_streaming_gpu_blocks == 0 {
                return Err(Error::Config(
                    "num_streaming_gpu_blocks must be positive when sparse attention is enabled"
                        .into(),
                ));
            }
            if self.num_streaming_cpu_blocks == 0 {
                return Err(Error::Config(
                    "num_streaming_cpu_blocks must be positive when sparse attention is enabled"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_block_size() -> usize {
    16
}

fn default_num_retrieval_gpu_blocks() -> usize {
    1024
}

fn default_num_retrieval_cpu_blocks() -> usize {
    256
}

/// In-flight batching toggle.
///
/// In IFB mode prompt admission reserves exactly the blocks the prompt
/// needs and the table grows during decoding. Outside IFB mode every
/// request is given a fixed `init_num_blocks` allocation up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IFBConfig {
    #[serde(default = "default_ifb_mode")]
    pub ifb_mode: bool,
}

impl Default for IFBConfig {
    fn default() -> Self {
        Self {
            ifb_mode: default_ifb_mode(),
        }
    }
}

fn default_ifb_mode() -> bool {
    true
}

/// Top-level configuration aggregating all engine sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub ifb: IFBConfig,
}

impl TesseraConfig {
    /// Parse a configuration from TOML text, keeping defaults for any
    /// omitted field.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TesseraConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.prompt_limit(), 2048);
        assert!(config.ifb.ifb_mode);
        assert!(config.cache.sp_attn_config.is_none());
    }

    #[test]
    fn parse_from_toml_keeps_defaults() {
        let config = TesseraConfig::from_toml_str(
            r#"
            [scheduler]
            max_num_seqs = 8

            [cache]
            block_size = 32
            num_streaming_gpu_blocks = 64
            num_streaming_cpu_blocks = 16

            [cache.sp_attn_config]
            sink_size = 64
            local_size = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_num_seqs, 8);
        assert_eq!(config.scheduler.max_model_len, 4096);
        assert_eq!(config.cache.block_size, 32);
        let sp_attn = config.cache.sp_attn_config.unwrap();
        assert_eq!(sp_attn.sink_size, 64);
        assert_eq!(sp_attn.local_size, 256);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_limits() {
        let mut config = TesseraConfig::default();
        config.scheduler.max_num_seqs = 0;
        assert!(config.validate().is_err());

        let mut config = TesseraConfig::default();
        config.cache.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sparse_attention_without_streaming_blocks() {
        let mut config = TesseraConfig::default();
        config.cache.sp_attn_config = Some(SpAttnConfig {
            sink_size: 64,
            local_size: 256,
        });
        assert!(config.validate().is_err());

        // GPU blocks alone are not enough; swap space needs blocks too.
        config.cache.num_streaming_gpu_blocks = 64;
        assert!(config.validate().is_err());

        config.cache.num_streaming_cpu_blocks = 16;
        config.validate().unwrap();
    }
}
