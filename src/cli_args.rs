use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use local_rag::{
    config::{DEFAULT_MAX_CONTEXT, DEFAULT_MAX_LENGTH, DEFAULT_SEED},
    ingest::{IngestConfig, SplitBy},
    EngineOptions, GenerationParams, ModelConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, env = "LOCAL_RAG_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert PDFs, split them and write them with embeddings to the document store
    Ingest(Box<Ingest>),

    /// Embed a query and print the closest stored documents
    Retrieve(Box<Retrieve>),

    /// Run a local model on a prompt, fitted into its context window
    Generate(Box<Generate>),
}

/// Overrides layered on top of the ingestion config file and environment
#[derive(ClapArgs, Debug)]
pub struct StoreArgs {
    /// Config file (toml, json or yaml); defaults to ./local-rag.* when present
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Weaviate class holding the documents
    #[arg(long)]
    pub index: Option<String>,

    /// Vector length of the store; must match the embedding model. The store
    /// default is 768, so use 384 with the default all-MiniLM-L6-v2 model
    #[arg(long)]
    pub embedding_dim: Option<usize>,

    /// Directory of the sentence-transformers embedding model
    #[arg(long)]
    pub embedding_model: Option<PathBuf>,
}

impl StoreArgs {
    pub fn load_config(&self) -> local_rag::ingest::IngestResult<IngestConfig> {
        let mut config = IngestConfig::load(self.config.as_deref())?;

        if let Some(host) = &self.host {
            config.store.host = host.clone();
        }
        if let Some(port) = self.port {
            config.store.port = port;
        }
        if let Some(index) = &self.index {
            config.store.index = index.clone();
        }
        if let Some(dim) = self.embedding_dim {
            config.store.embedding_dim = dim;
        }
        if let Some(model) = &self.embedding_model {
            config.embedder.model_path = model.clone();
        }

        config.store.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
pub struct Ingest {
    /// PDF files to ingest
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// How documents are split: word, sentence or passage
    #[arg(long)]
    pub split_by: Option<SplitBy>,

    /// Split length in units of --split-by
    #[arg(long)]
    pub split_length: Option<usize>,

    #[arg(long)]
    pub split_overlap: Option<usize>,

    /// Recompute embeddings for documents that already have one
    #[arg(long, default_value_t = false)]
    pub update_existing: bool,
}

impl Ingest {
    pub fn ingest_config(&self) -> local_rag::ingest::IngestResult<IngestConfig> {
        let mut config = self.store.load_config()?;

        if let Some(split_by) = self.split_by {
            config.preprocessor.split_by = split_by;
        }
        if let Some(length) = self.split_length {
            config.preprocessor.split_length = length;
        }
        if let Some(overlap) = self.split_overlap {
            config.preprocessor.split_overlap = overlap;
        }
        config.update_existing_embeddings |= self.update_existing;

        config.preprocessor.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
pub struct Retrieve {
    pub query: String,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Number of documents to return
    #[arg(long, short = 'k', default_value_t = 5)]
    pub top_k: usize,
}

#[derive(Parser, Debug)]
pub struct Generate {
    /// Directory with config.json, tokenizer.json and safetensors weights
    #[arg(long, short = 'm')]
    pub model: String,

    /// The prompt to feed the model
    #[arg(long, short = 'p', conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    /// A file to read the prompt from
    #[arg(long, short = 'f')]
    pub prompt_file: Option<PathBuf>,

    /// Tokens reserved for the completion
    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
    pub max_length: usize,

    /// Token budget of the context window
    #[arg(long, default_value_t = DEFAULT_MAX_CONTEXT)]
    pub max_context: usize,

    /// Tokens to generate; defaults to --max-length
    #[arg(long, short = 'n')]
    pub max_tokens: Option<usize>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    /// Stop before this sequence; may be repeated
    #[arg(long)]
    pub stop: Vec<String>,

    /// Print the prompt before the completion
    #[arg(long, default_value_t = false)]
    pub echo: bool,

    #[arg(long)]
    pub suffix: Option<String>,

    /// Report this many alternative log-probabilities per token
    #[arg(long)]
    pub logprobs: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Print fragments as they are generated
    #[arg(long, default_value_t = false)]
    pub stream: bool,

    /// Load weights into memory instead of memory-mapping them
    #[arg(long, default_value_t = false)]
    pub no_mmap: bool,

    /// Keep the cache in full precision
    #[arg(long, default_value_t = false)]
    pub f32: bool,
}

impl Generate {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.model.clone())
            .with_max_length(self.max_length)
            .with_max_context(self.max_context)
            .with_engine_options(EngineOptions {
                seed: self.seed,
                use_mmap: !self.no_mmap,
                f16_kv: !self.f32,
                ..Default::default()
            })
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            suffix: self.suffix.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            logprobs: self.logprobs,
            echo: self.echo.then_some(true),
            repeat_penalty: self.repeat_penalty,
            top_k: self.top_k,
            stop: self.stop.clone(),
        }
    }
}
