use std::cmp::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{Document, Embedder, IngestError, IngestResult};

/// A document store that can hold embeddings and answer similarity queries
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Length of the vectors stored alongside documents
    fn embedding_dim(&self) -> usize;

    /// Insert documents, replacing any with the same ID. Returns how many were written.
    async fn write_documents(&self, documents: Vec<Document>) -> IngestResult<usize>;

    /// Every stored document with its embedding, if any
    async fn get_all_documents(&self) -> IngestResult<Vec<Document>>;

    /// Number of stored documents
    async fn get_document_count(&self) -> IngestResult<usize>;

    /// Most similar documents first, each with its `score` set
    async fn query_by_embedding(&self, query: &[f32], top_k: usize) -> IngestResult<Vec<Document>>;

    /// Compute embeddings for stored documents.
    ///
    /// Only documents without an embedding are touched unless `update_existing` is set.
    /// Returns the number of documents updated.
    async fn update_embeddings(
        &self,
        embedder: &dyn Embedder,
        update_existing: bool,
    ) -> IngestResult<usize> {
        check_dimension(self.embedding_dim(), embedder.dimension(), "embedder")?;

        let pending: Vec<Document> = self
            .get_all_documents()
            .await?
            .into_iter()
            .filter(|doc| update_existing || doc.embedding.is_none())
            .collect();
        if pending.is_empty() {
            info!("No documents need embeddings");
            return Ok(0);
        }

        let texts: Vec<String> = pending.iter().map(|doc| doc.content.clone()).collect();
        let embeddings = embedder.embed_documents(&texts).await?;
        if embeddings.len() != pending.len() {
            return Err(IngestError::Embedding(format!(
                "embedder returned {} vectors for {} documents",
                embeddings.len(),
                pending.len()
            )));
        }

        let updated: Vec<Document> = pending
            .into_iter()
            .zip(embeddings)
            .map(|(doc, embedding)| doc.with_embedding(embedding))
            .collect();
        let count = self.write_documents(updated).await?;

        info!(count, "Updated embeddings");
        Ok(count)
    }
}

pub(crate) fn check_dimension(expected: usize, actual: usize, what: &str) -> IngestResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(IngestError::Validation(format!(
            "{what} dimension {actual} does not match the store's embedding_dim {expected}"
        )))
    }
}

/// Cosine similarity, zero when either vector has no length
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Document store kept in process memory, in insertion order
pub struct InMemoryDocumentStore {
    embedding_dim: usize,
    documents: RwLock<Vec<Document>>,
}

impl InMemoryDocumentStore {
    /// Empty store for vectors of length `embedding_dim`
    pub fn new(embedding_dim: usize) -> IngestResult<Self> {
        if embedding_dim == 0 {
            return Err(IngestError::Validation(
                "embedding_dim must be greater than zero".into(),
            ));
        }
        Ok(Self {
            embedding_dim,
            documents: RwLock::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    async fn write_documents(&self, documents: Vec<Document>) -> IngestResult<usize> {
        for doc in &documents {
            if let Some(embedding) = &doc.embedding {
                check_dimension(self.embedding_dim, embedding.len(), "document embedding")?;
            }
        }

        let count = documents.len();
        let mut stored = self.documents.write();
        for doc in documents {
            match stored.iter_mut().find(|existing| existing.id == doc.id) {
                Some(existing) => *existing = doc,
                None => stored.push(doc),
            }
        }

        debug!(count, total = stored.len(), "Wrote documents");
        Ok(count)
    }

    async fn get_all_documents(&self) -> IngestResult<Vec<Document>> {
        Ok(self.documents.read().clone())
    }

    async fn get_document_count(&self) -> IngestResult<usize> {
        Ok(self.documents.read().len())
    }

    async fn query_by_embedding(&self, query: &[f32], top_k: usize) -> IngestResult<Vec<Document>> {
        check_dimension(self.embedding_dim, query.len(), "query")?;

        let stored = self.documents.read();
        let mut scored: Vec<Document> = stored
            .iter()
            .filter_map(|doc| {
                let score = cosine_similarity(query, doc.embedding.as_deref()?);
                let mut hit = doc.clone();
                hit.score = Some(score);
                Some(hit)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}
