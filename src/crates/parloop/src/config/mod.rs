//! Engine configuration
//!
//! [`EngineConfig`] tunes worker count and batch sizing. It can be built in
//! code, parsed from YAML, or loaded from environment variables, and the
//! sources can be layered with [`EngineConfig::merge`].
//!
//! # Example
//!
//! ```rust,no_run
//! use parloop::EngineConfig;
//!
//! # fn example() -> parloop::Result<()> {
//! let mut config = EngineConfig::from_yaml("max_degree_of_parallelism: 4")?;
//! config.merge(EngineConfig::from_env(EngineConfig::ENV_PREFIX)?);
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

mod env;

pub use env::{build_env_key, get_env, get_env_parse};

use crate::error::{ParallelError, Result};
use serde::{Deserialize, Serialize};

/// Tuning knobs for [`crate::ParallelEngine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrently active workers; 0 means available hardware parallelism
    pub max_degree_of_parallelism: usize,

    /// Fixed batch size for range loops; derived from the range length when unset
    pub chunk_size: Option<usize>,

    /// Target number of range batches per worker when `chunk_size` is unset
    pub chunks_per_worker: usize,

    /// Upper bound for the doubling batch size of sequence loops
    pub max_sequence_chunk: usize,

    /// Prefix for worker thread names
    pub worker_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 0,
            chunk_size: None,
            chunks_per_worker: 4,
            max_sequence_chunk: 64,
            worker_name_prefix: "parloop-worker".to_string(),
        }
    }
}

impl EngineConfig {
    /// Default environment variable prefix
    pub const ENV_PREFIX: &'static str = "PARLOOP_";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_degree_of_parallelism(mut self, workers: usize) -> Self {
        self.max_degree_of_parallelism = workers;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_chunks_per_worker(mut self, chunks: usize) -> Self {
        self.chunks_per_worker = chunks;
        self
    }

    pub fn with_max_sequence_chunk(mut self, max_chunk: usize) -> Self {
        self.max_sequence_chunk = max_chunk;
        self
    }

    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Number of workers a run will use
    pub fn effective_parallelism(&self) -> usize {
        match self.max_degree_of_parallelism {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }

    /// Check that every batch size is usable
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == Some(0) {
            return Err(ParallelError::Configuration(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if self.chunks_per_worker == 0 {
            return Err(ParallelError::Configuration(
                "chunks_per_worker must be greater than zero".into(),
            ));
        }
        if self.max_sequence_chunk == 0 {
            return Err(ParallelError::Configuration(
                "max_sequence_chunk must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse a configuration from YAML; missing fields take their defaults
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| ParallelError::Configuration(format!("Invalid YAML configuration: {}", e)))
    }

    /// Load a configuration from `{prefix}FIELD_NAME` environment variables
    ///
    /// Fields without a variable keep their defaults.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let key = |name: &str| build_env_key(prefix, name);
        let mut config = Self::default();

        if let Some(n) = get_env_parse(&key("max_degree_of_parallelism"))? {
            config.max_degree_of_parallelism = n;
        }
        if let Some(n) = get_env_parse(&key("chunk_size"))? {
            config.chunk_size = Some(n);
        }
        if let Some(n) = get_env_parse(&key("chunks_per_worker"))? {
            config.chunks_per_worker = n;
        }
        if let Some(n) = get_env_parse(&key("max_sequence_chunk"))? {
            config.max_sequence_chunk = n;
        }
        if let Some(prefix) = get_env(&key("worker_name_prefix"))? {
            config.worker_name_prefix = prefix;
        }

        Ok(config)
    }

    /// Overlay every field of `other` that differs from the default
    pub fn merge(&mut self, other: Self) -> &mut Self {
        let defaults = Self::default();

        if other.max_degree_of_parallelism != defaults.max_degree_of_parallelism {
            self.max_degree_of_parallelism = other.max_degree_of_parallelism;
        }
        if other.chunk_size.is_some() {
            self.chunk_size = other.chunk_size;
        }
        if other.chunks_per_worker != defaults.chunks_per_worker {
            self.chunks_per_worker = other.chunks_per_worker;
        }
        if other.max_sequence_chunk != defaults.max_sequence_chunk {
            self.max_sequence_chunk = other.max_sequence_chunk;
        }
        if other.worker_name_prefix != defaults.worker_name_prefix {
            self.worker_name_prefix = other.worker_name_prefix;
        }
        self
    }
}
