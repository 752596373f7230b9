//! Local RAG - PDF ingestion into a vector store and a local LLM invocation layer
//!
//! The ingestion side converts PDFs to page documents, cleans and splits them,
//! writes them to a document store and computes their embeddings. The invocation
//! side runs a locally loaded model behind a uniform call contract, fitting every
//! prompt into the model's context window before generation.

#![warn(missing_docs)]

use std::fmt;

use candle_core::Device;

pub mod config;
pub mod error;
pub mod ingest;
pub mod invocation;
pub mod model;
pub mod types;
pub mod utils;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{EngineOptions, ModelConfig};
pub use error::{InvocationError, Result};
pub use ingest::{
    Document, DocumentStore, EmbeddingRetriever, IngestError, IngestionPipeline, IngestionReport,
};
pub use invocation::{fit_prompt, InvocationLayer, LocalModelInvocationLayer, TextGenerationEngine};
pub use model::CandleLlamaEngine;
pub use types::{GenerationParams, GenerationRequest, Prompt};

/// Feature detection for supported backends
pub struct Features {
    /// Whether the crate was built with CUDA support
    pub cuda: bool,
    /// Whether a CUDA device could be opened
    pub cuda_device: bool,
}

impl Features {
    /// Detect available features at runtime
    pub fn detect() -> Self {
        let cuda = cfg!(feature = "cuda");
        let cuda_device = cuda && Device::new_cuda(0).is_ok();
        Self { cuda, cuda_device }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        if self.cuda {
            writeln!(
                f,
                "CUDA device: {}",
                if self.cuda_device { "available" } else { "not found" }
            )?;
        }
        Ok(())
    }
}
