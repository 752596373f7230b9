use std::sync::Arc;

use tracing::debug;

use super::store::check_dimension;
use super::{Document, DocumentStore, Embedder, IngestError, IngestResult};

/// Finds the stored documents closest to a query in embedding space
pub struct EmbeddingRetriever {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
}

impl EmbeddingRetriever {
    /// Fails when `top_k` is zero or the embedder does not fit the store
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
    ) -> IngestResult<Self> {
        if top_k == 0 {
            return Err(IngestError::Validation("top_k must be greater than zero".into()));
        }
        check_dimension(store.embedding_dim(), embedder.dimension(), "embedder")?;

        Ok(Self {
            store,
            embedder,
            top_k,
        })
    }

    /// Embedder used for queries and documents
    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// The `top_k` documents closest to `query`, best first
    pub async fn retrieve(&self, query: &str) -> IngestResult<Vec<Document>> {
        let vector = self.embedder.embed_query(query).await?;
        let documents = self.store.query_by_embedding(&vector, self.top_k).await?;
        debug!(hits = documents.len(), top_k = self.top_k, "Retrieved documents");
        Ok(documents)
    }

    /// Embed every stored document that has no embedding yet
    pub async fn update_store_embeddings(&self) -> IngestResult<usize> {
        self.store.update_embeddings(self.embedder(), false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::{meta, KeywordEmbedder};
    use crate::ingest::InMemoryDocumentStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_retrieve_after_embedding() {
        let store = Arc::new(InMemoryDocumentStore::new(2).unwrap());
        store
            .write_documents(vec![
                Document::new("Dividend policy", meta("a.pdf", 1)),
                Document::new("Board of directors", meta("a.pdf", 2)),
            ])
            .await
            .unwrap();

        let embedder = Arc::new(KeywordEmbedder::new(&["dividend", "board"]));
        let retriever = EmbeddingRetriever::new(store, embedder, 1).unwrap();
        assert_eq!(retriever.update_store_embeddings().await.unwrap(), 2);

        let hits = retriever.retrieve("who sits on the board").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Board of directors");
    }

    #[test]
    fn test_construction_checks() {
        let store = Arc::new(InMemoryDocumentStore::new(3).unwrap());
        let embedder = Arc::new(KeywordEmbedder::new(&["dividend", "board"]));
        assert!(matches!(
            EmbeddingRetriever::new(store.clone(), embedder.clone(), 5),
            Err(IngestError::Validation(_))
        ));

        let embedder = Arc::new(KeywordEmbedder::new(&["a", "b", "c"]));
        assert!(EmbeddingRetriever::new(store, embedder, 0).is_err());
    }
}
