//! Ingestion flow: PDF pages to cleaned, split documents in a vector store with embeddings

mod converter;
mod embedder;
mod pipeline;
mod preprocess;
mod retriever;
mod store;
mod weaviate;

pub use converter::{PdfToDocument, PAGE_BREAK};
pub use embedder::{BertEmbedder, BertEmbedderConfig, Embedder};
pub use pipeline::{IngestConfig, IngestionPipeline, IngestionReport};
pub use preprocess::{PreProcessor, PreProcessorConfig, SplitBy};
pub use retriever::EmbeddingRetriever;
pub use store::{cosine_similarity, DocumentStore, InMemoryDocumentStore};
pub use weaviate::{WeaviateConfig, WeaviateDocumentStore};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Result type of the ingestion flow
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors raised while ingesting or retrieving documents
#[derive(Error, Debug)]
pub enum IngestError {
    /// The PDF could not be read
    #[error("PDF error: {0}")]
    Pdf(String),
    /// Settings or data that do not fit together
    #[error("Validation error: {0}")]
    Validation(String),
    /// The document store rejected a request
    #[error("Document store error: {0}")]
    Store(String),
    /// The embedding model failed
    #[error("Embedding error: {0}")]
    Embedding(String),
    /// Layered settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    /// A request to the document store failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Reading or writing a file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A payload could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A blocking task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<lopdf::Error> for IngestError {
    fn from(err: lopdf::Error) -> Self {
        IngestError::Pdf(err.to_string())
    }
}

impl From<candle_core::Error> for IngestError {
    fn from(err: candle_core::Error) -> Self {
        IngestError::Embedding(err.to_string())
    }
}

/// A unit of text moving through the ingestion flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Deterministic UUID, see [`Document::new`]
    pub id: String,
    /// Text of the document
    pub content: String,
    /// Provenance such as `file_path`, `page` and `_split_id`
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Set once the document has been embedded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Similarity to the query a document was retrieved for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Document {
    /// New document whose ID is derived from its content and meta, so writing the
    /// same text twice upserts rather than duplicates.
    pub fn new(content: impl Into<String>, meta: Map<String, Value>) -> Self {
        let content = content.into();
        Self {
            id: document_id(&content, &meta),
            content,
            meta,
            embedding: None,
            score: None,
        }
    }

    /// Attach an embedding, keeping the ID
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// `file_path` meta entry, if the document came from a file
    pub fn file_path(&self) -> Option<&str> {
        self.meta.get("file_path").and_then(Value::as_str)
    }
}

fn document_id(content: &str, meta: &Map<String, Value>) -> String {
    let mut key = Vec::with_capacity(content.len() + 64);
    key.extend_from_slice(content.as_bytes());
    key.push(0x1f);
    key.extend_from_slice(Value::Object(meta.clone()).to_string().as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &key).to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder for store and pipeline tests

    use async_trait::async_trait;

    use super::*;

    /// Embeds text as normalised counts of a fixed keyword list
    pub struct KeywordEmbedder {
        pub keywords: Vec<&'static str>,
    }

    impl KeywordEmbedder {
        pub fn new(keywords: &[&'static str]) -> Self {
            Self {
                keywords: keywords.to_vec(),
            }
        }

        pub fn vector(&self, text: &str) -> Vec<f32> {
            let lower = text.to_lowercase();
            let counts: Vec<f32> = self
                .keywords
                .iter()
                .map(|keyword| lower.matches(keyword).count() as f32)
                .collect();
            let norm = counts.iter().map(|c| c * c).sum::<f32>().sqrt();
            if norm == 0.0 {
                counts
            } else {
                counts.iter().map(|c| c / norm).collect()
            }
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn dimension(&self) -> usize {
            self.keywords.len()
        }

        async fn embed_documents(&self, texts: &[String]) -> IngestResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|text| self.vector(text)).collect())
        }
    }

    pub fn meta(file_path: &str, page: u32) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("file_path".to_string(), file_path.into());
        meta.insert("page".to_string(), page.into());
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::testing::meta;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_document_id_is_deterministic() {
        let a = Document::new("Executive compensation", meta("proxy.pdf", 3));
        let b = Document::new("Executive compensation", meta("proxy.pdf", 3));
        assert_eq!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_document_id_depends_on_meta() {
        let a = Document::new("Executive compensation", meta("proxy.pdf", 3));
        let b = Document::new("Executive compensation", meta("proxy.pdf", 4));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_file_path() {
        let doc = Document::new("text", meta("reports/annual.pdf", 1));
        assert_eq!(doc.file_path(), Some("reports/annual.pdf"));
        assert_eq!(Document::new("text", Map::new()).file_path(), None);
    }

    #[test]
    fn test_error_messages() {
        let err = IngestError::Validation("embedding_dim must be positive".to_string());
        assert_eq!(err.to_string(), "Validation error: embedding_dim must be positive");
    }
}
