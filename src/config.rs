//! Model configuration captured when an invocation layer is built

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{InvocationError, Result};

/// Tokens reserved for generation unless configured otherwise
pub const DEFAULT_MAX_LENGTH: usize = 128;
/// Context window used unless configured otherwise
pub const DEFAULT_MAX_CONTEXT: usize = 2048;
/// Sampling seed used unless configured otherwise
pub const DEFAULT_SEED: u64 = 1337;
/// Prompt batch size engines are expected to use
pub const DEFAULT_BATCH_SIZE: usize = 512;
/// Repeat penalty window used unless configured otherwise
pub const DEFAULT_LAST_N_TOKENS_SIZE: usize = 64;

/// Configuration captured once when an invocation layer is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier or path to the model directory
    pub model_name_or_path: String,

    /// Tokens reserved for generated output
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Total token budget of the context window
    #[serde(default = "default_max_context")]
    pub max_context: usize,

    /// Options handed to the engine untouched
    #[serde(default)]
    pub engine: EngineOptions,
}

/// Engine options. Their meaning belongs to the engine; the layer only carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Model partition hint, -1 lets the engine decide
    pub n_parts: i32,

    /// Random seed for sampling
    pub seed: u64,

    /// Keep the key/value cache in half precision
    pub f16_kv: bool,

    /// Return logits for every token, not only the last one
    pub logits_all: bool,

    /// Load only the vocabulary
    pub vocab_only: bool,

    /// Memory-map the weights
    pub use_mmap: bool,

    /// Lock the weights in memory
    pub use_mlock: bool,

    /// Run the model in embedding mode
    pub embedding: bool,

    /// Worker threads, None lets the engine decide
    pub n_threads: Option<usize>,

    /// Prompt batch size
    pub n_batch: usize,

    /// Window of recent tokens considered by the repeat penalty
    pub last_n_tokens_size: usize,

    /// Base model for a LoRA adapter
    pub lora_base: Option<PathBuf>,

    /// LoRA adapter to apply
    pub lora_path: Option<PathBuf>,

    /// Emit load diagnostics
    pub verbose: bool,
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_max_context() -> usize {
    DEFAULT_MAX_CONTEXT
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            n_parts: -1,
            seed: DEFAULT_SEED,
            f16_kv: true,
            logits_all: false,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            n_threads: None,
            n_batch: DEFAULT_BATCH_SIZE,
            last_n_tokens_size: DEFAULT_LAST_N_TOKENS_SIZE,
            lora_base: None,
            lora_path: None,
            verbose: true,
        }
    }
}

impl ModelConfig {
    /// Config with default budgets and engine options for the given model.
    pub fn new(model_name_or_path: impl Into<String>) -> Self {
        Self {
            model_name_or_path: model_name_or_path.into(),
            max_length: DEFAULT_MAX_LENGTH,
            max_context: DEFAULT_MAX_CONTEXT,
            engine: EngineOptions::default(),
        }
    }

    /// Set the tokens reserved for generation
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the context window
    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    /// Replace the engine options
    pub fn with_engine_options(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Reject a config no engine could be built from
    pub fn validate(&self) -> Result<()> {
        if self.model_name_or_path.is_empty() {
            return Err(InvocationError::configuration(
                "model_name_or_path",
                "model_name_or_path cannot be None or empty string",
            ));
        }

        if self.max_context == 0 {
            return Err(InvocationError::configuration(
                "max_context",
                "context window must hold at least one token",
            ));
        }

        if self.engine.n_batch == 0 {
            return Err(InvocationError::configuration(
                "n_batch",
                "batch size must be positive",
            ));
        }

        if self.engine.n_threads == Some(0) {
            return Err(InvocationError::configuration(
                "n_threads",
                "thread count must be positive when specified",
            ));
        }

        if self.engine.lora_base.is_some() && self.engine.lora_path.is_none() {
            return Err(InvocationError::configuration(
                "lora_base",
                "lora_base requires lora_path",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::new("models/llama-2-7b");
        assert_eq!(config.max_length, 128);
        assert_eq!(config.max_context, 2048);
        assert_eq!(config.engine.seed, 1337);
        assert_eq!(config.engine.n_batch, 512);
        assert_eq!(config.engine.last_n_tokens_size, 64);
        assert!(config.engine.f16_kv);
        assert!(config.engine.use_mmap);
        assert!(config.engine.verbose);
        assert!(!config.engine.vocab_only);
        assert_eq!(config.engine.n_threads, None);
    }

    #[test]
    fn test_config_validation() {
        assert!(ModelConfig::new("models/llama-2-7b").validate().is_ok());

        let err = ModelConfig::new("").validate().unwrap_err();
        assert!(matches!(
            err,
            InvocationError::ConfigurationError { ref parameter, .. } if parameter == "model_name_or_path"
        ));

        let err = ModelConfig::new("model").with_max_context(0).validate().unwrap_err();
        assert!(matches!(err, InvocationError::ConfigurationError { .. }));

        let mut config = ModelConfig::new("model");
        config.engine.lora_base = Some(PathBuf::from("base.gguf"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ModelConfig = serde_json::from_str(
            r#"{"model_name_or_path": "models/tiny", "engine": {"seed": 7, "use_mmap": false}}"#,
        )
        .unwrap();

        assert_eq!(config.max_length, DEFAULT_MAX_LENGTH);
        assert_eq!(config.max_context, DEFAULT_MAX_CONTEXT);
        assert_eq!(config.engine.seed, 7);
        assert!(!config.engine.use_mmap);
        assert!(config.engine.f16_kv);
    }
}
