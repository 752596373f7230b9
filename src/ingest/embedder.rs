use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::{Deserialize, Serialize};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

use super::{IngestError, IngestResult};
use crate::model::{load_weights, ModelFiles};

/// Turns text into fixed-size vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder produces
    fn dimension(&self) -> usize;

    /// One vector per text, in input order
    async fn embed_documents(&self, texts: &[String]) -> IngestResult<Vec<Vec<f32>>>;

    /// Embed a single query text
    async fn embed_query(&self, text: &str) -> IngestResult<Vec<f32>> {
        self.embed_documents(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| IngestError::Embedding("embedder returned no vector".into()))
    }
}

/// Where and how to run the BERT embedding model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BertEmbedderConfig {
    /// Directory holding a sentence-transformers BERT export
    pub model_path: PathBuf,
    /// Texts per forward pass
    pub batch_size: usize,
    /// Longer inputs are truncated to this many tokens
    pub max_seq_length: usize,
}

impl Default for BertEmbedderConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/all-MiniLM-L6-v2"),
            batch_size: 32,
            max_seq_length: 256,
        }
    }
}

#[derive(Deserialize)]
struct HiddenSize {
    hidden_size: usize,
}

struct BertInner {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

/// Sentence embeddings from a BERT model: mean pooled over the attention mask and
/// L2 normalised
pub struct BertEmbedder {
    inner: Arc<BertInner>,
    dimension: usize,
    batch_size: usize,
}

impl BertEmbedder {
    /// Load weights, config and tokenizer from `config.model_path`
    pub fn load(config: &BertEmbedderConfig) -> IngestResult<Self> {
        if config.batch_size == 0 || config.max_seq_length == 0 {
            return Err(IngestError::Validation(
                "batch_size and max_seq_length must be greater than zero".into(),
            ));
        }

        let files = ModelFiles::resolve(&config.model_path)
            .map_err(|e| IngestError::Embedding(e.to_string()))?;
        let raw_config = std::fs::read(&files.config)?;
        let bert_config: BertConfig = serde_json::from_slice(&raw_config)?;
        let dimension = serde_json::from_slice::<HiddenSize>(&raw_config)?.hidden_size;

        let mut tokenizer = load_tokenizer(&files.tokenizer)?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_seq_length,
                ..Default::default()
            }))
            .map_err(|e| IngestError::Embedding(format!("invalid truncation: {e}")))?;

        let device = crate::model::select_device();
        let vb: VarBuilder = load_weights(&files.weights, DType::F32, &device, true)
            .map_err(|e| IngestError::Embedding(e.to_string()))?;
        let model = BertModel::load(vb, &bert_config)?;

        info!(
            model = %config.model_path.display(),
            dimension,
            "Loaded embedding model"
        );

        Ok(Self {
            inner: Arc::new(BertInner {
                model,
                tokenizer,
                device,
            }),
            dimension,
            batch_size: config.batch_size,
        })
    }
}

fn load_tokenizer(path: &Path) -> IngestResult<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| {
        IngestError::Embedding(format!("failed to load tokenizer {}: {e}", path.display()))
    })
}

impl BertInner {
    fn embed_batch(&self, texts: Vec<String>) -> IngestResult<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| IngestError::Embedding(format!("tokenization failed: {e}")))?;

        let ids = encodings
            .iter()
            .map(|e| Tensor::new(e.get_ids(), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let masks = encodings
            .iter()
            .map(|e| Tensor::new(e.get_attention_mask(), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let ids = Tensor::stack(&ids, 0)?;
        let mask = Tensor::stack(&masks, 0)?;
        let type_ids = ids.zeros_like()?;

        let hidden = self.model.forward(&ids, &type_ids, Some(&mask))?;
        let pooled = mean_pool_normalized(&hidden, &mask)?;
        Ok(pooled.to_vec2::<f32>()?)
    }
}

/// Average token vectors where the mask is set, then scale each row to unit length
pub(crate) fn mean_pool_normalized(hidden: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1e-9f32, f32::MAX)?;
    let pooled = summed.broadcast_div(&counts)?;

    let norms = pooled.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
    pooled.broadcast_div(&norms)
}

#[async_trait]
impl Embedder for BertEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_documents(&self, texts: &[String]) -> IngestResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let inner = self.inner.clone();
            let batch = batch.to_vec();
            let embedded = tokio::task::spawn_blocking(move || inner.embed_batch(batch)).await??;
            vectors.extend(embedded);
        }

        debug!(count = vectors.len(), "Embedded documents");
        Ok(vectors)
    }
}
