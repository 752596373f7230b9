//! Local text generation backed by candle Llama models

mod loader;
mod runtime;
mod tokenizer;

pub use loader::{load_weights, ModelFiles};
pub use runtime::CandleLlamaEngine;
pub use tokenizer::{LlamaTokenizer, TokenDecoder};

use candle_core::Device;
use tracing::warn;

use crate::config::{EngineOptions, DEFAULT_BATCH_SIZE};

// Generation defaults for parameters a request leaves unset
pub(crate) const DEFAULT_MAX_TOKENS: usize = 16;
pub(crate) const DEFAULT_TEMPERATURE: f64 = 0.8;
pub(crate) const DEFAULT_TOP_P: f64 = 0.95;
pub(crate) const DEFAULT_TOP_K: usize = 40;
pub(crate) const DEFAULT_REPEAT_PENALTY: f32 = 1.1;

/// CUDA device 0 when built with the `cuda` feature and one is present, CPU otherwise
pub(crate) fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            warn!(error = %e, "CUDA device unavailable, falling back to CPU");
            Device::Cpu
        }
    }
}

/// Engine options set away from their defaults that the candle backend cannot honour
pub(crate) fn unsupported_options(options: &EngineOptions) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if options.n_parts != -1 {
        ignored.push("n_parts");
    }
    if options.logits_all {
        ignored.push("logits_all");
    }
    if options.use_mlock {
        ignored.push("use_mlock");
    }
    if options.embedding {
        ignored.push("embedding");
    }
    if options.n_threads.is_some() {
        ignored.push("n_threads");
    }
    if options.n_batch != DEFAULT_BATCH_SIZE {
        ignored.push("n_batch");
    }
    if options.lora_base.is_some() {
        ignored.push("lora_base");
    }
    if options.lora_path.is_some() {
        ignored.push("lora_path");
    }
    ignored
}
