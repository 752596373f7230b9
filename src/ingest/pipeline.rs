use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::store::check_dimension;
use super::{
    BertEmbedderConfig, Document, DocumentStore, Embedder, IngestResult, PdfToDocument,
    PreProcessor, PreProcessorConfig, SplitBy, WeaviateConfig, PAGE_BREAK,
};

const CONFIG_FILE: &str = "local-rag";
const ENV_PREFIX: &str = "LOCAL_RAG";

/// Settings for a full ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Cleaning and splitting
    pub preprocessor: PreProcessorConfig,
    /// Target document store
    pub store: WeaviateConfig,
    /// Embedding model
    pub embedder: BertEmbedderConfig,
    /// Recompute embeddings for documents that already have one
    pub update_existing_embeddings: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            preprocessor: PreProcessorConfig {
                clean_empty_lines: true,
                clean_whitespace: false,
                clean_header_footer: true,
                split_by: SplitBy::Word,
                split_length: 500,
                split_overlap: 0,
                split_respect_sentence_boundary: true,
            },
            store: WeaviateConfig::default(),
            embedder: BertEmbedderConfig::default(),
            update_existing_embeddings: false,
        }
    }
}

impl IngestConfig {
    /// Layer an optional config file and `LOCAL_RAG__*` environment variables over
    /// the defaults.
    ///
    /// Without an explicit path, `local-rag.{toml,json,yaml}` in the working directory
    /// is used when present.
    pub fn load(path: Option<&Path>) -> IngestResult<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.preprocessor.validate()?;
        config.store.validate()?;
        Ok(config)
    }
}

/// What an ingestion run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    /// Pages across the converted documents
    pub pages: usize,
    /// Splits written to the store
    pub documents_written: usize,
    /// Documents whose embedding was (re)computed
    pub embeddings_updated: usize,
}

/// PDF conversion, preprocessing, store write and embedding update, in that order
pub struct IngestionPipeline {
    converter: PdfToDocument,
    preprocessor: PreProcessor,
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
    update_existing: bool,
}

impl IngestionPipeline {
    /// Fails when the embedder's vectors do not fit the store
    pub fn new(
        preprocessor: PreProcessor,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
    ) -> IngestResult<Self> {
        check_dimension(store.embedding_dim(), embedder.dimension(), "embedder")?;

        Ok(Self {
            converter: PdfToDocument::new(),
            preprocessor,
            store,
            embedder,
            update_existing: false,
        })
    }

    /// Re-embed documents that already have an embedding
    pub fn update_existing(mut self, update_existing: bool) -> Self {
        self.update_existing = update_existing;
        self
    }

    /// Convert the PDFs at `paths` and ingest them
    pub async fn run(&self, paths: &[PathBuf]) -> IngestResult<IngestionReport> {
        let converted = self.converter.run(paths).await?;
        self.ingest_documents(converted).await
    }

    /// Everything after conversion
    pub async fn ingest_documents(&self, converted: Vec<Document>) -> IngestResult<IngestionReport> {
        let start = Instant::now();
        let page_count = converted
            .iter()
            .map(|doc| doc.content.matches(PAGE_BREAK).count() + 1)
            .sum();

        let documents = self.preprocessor.process(converted)?;
        let documents_written = self.store.write_documents(documents).await?;
        info!(documents_written, "Wrote documents to store");

        let embeddings_updated = self
            .store
            .update_embeddings(self.embedder.as_ref(), self.update_existing)
            .await?;

        let report = IngestionReport {
            pages: page_count,
            documents_written,
            embeddings_updated,
        };
        info!(?report, elapsed = ?start.elapsed(), "Ingestion finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::converter::tests::write_pdf;
    use crate::ingest::testing::{meta, KeywordEmbedder};
    use crate::ingest::{IngestError, InMemoryDocumentStore};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn pipeline(store: Arc<InMemoryDocumentStore>) -> IngestResult<IngestionPipeline> {
        let preprocessor = PreProcessor::new(PreProcessorConfig {
            split_length: 4,
            ..Default::default()
        })
        .unwrap();
        let embedder = Arc::new(KeywordEmbedder::new(&["board", "pay", "vote"]));
        IngestionPipeline::new(preprocessor, store, embedder)
    }

    #[tokio::test]
    async fn test_ingest_documents_end_to_end() {
        let store = Arc::new(InMemoryDocumentStore::new(3).unwrap());
        let pipeline = pipeline(store.clone()).unwrap();

        let pages = vec![
            Document::new("The board met. Pay was reviewed.", meta("proxy.pdf", 1)),
            Document::new("Shareholders vote in May.", meta("proxy.pdf", 2)),
        ];
        let report = pipeline.ingest_documents(pages).await.unwrap();
        assert_eq!(
            report,
            IngestionReport {
                pages: 2,
                documents_written: 3,
                embeddings_updated: 3,
            }
        );

        let stored = store.get_all_documents().await.unwrap();
        assert!(stored.iter().all(|doc| doc.embedding.is_some()));

        let again = pipeline
            .ingest_documents(vec![Document::new("Shareholders vote in May.", meta("proxy.pdf", 2))])
            .await
            .unwrap();
        // the rewritten split replaces the stored one, so only it needs a new embedding
        assert_eq!(again.documents_written, 1);
        assert_eq!(again.embeddings_updated, 1);
        assert_eq!(store.get_document_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_from_pdf_splits_across_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.pdf");
        write_pdf(&path, &["Board nominees are listed.", "Advisory vote on pay."]);

        let store = Arc::new(InMemoryDocumentStore::new(3).unwrap());
        let pipeline = IngestionPipeline::new(
            PreProcessor::new(IngestConfig::default().preprocessor).unwrap(),
            store.clone(),
            Arc::new(KeywordEmbedder::new(&["board", "pay", "vote"])),
        )
        .unwrap();

        let report = pipeline.run(&[path.clone()]).await.unwrap();
        assert_eq!(
            report,
            IngestionReport {
                pages: 2,
                documents_written: 1,
                embeddings_updated: 1,
            }
        );

        let stored = store.get_all_documents().await.unwrap();
        assert!(stored[0].content.contains("Board nominees are listed."));
        assert!(stored[0].content.contains("Advisory vote on pay."));
        assert_eq!(stored[0].file_path(), Some(path.display().to_string().as_str()));
        assert_eq!(stored[0].meta["page"], 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_before_writing() {
        let store = Arc::new(InMemoryDocumentStore::new(768).unwrap());
        let result = pipeline(store.clone());
        assert!(matches!(result, Err(IngestError::Validation(_))));
        assert_eq!(store.get_document_count().await.unwrap(), 0);
    }

    #[test]
    fn test_default_config_mirrors_ingestion_script() {
        let config = IngestConfig::default();
        assert!(!config.preprocessor.clean_whitespace);
        assert!(config.preprocessor.clean_header_footer);
        assert_eq!(config.preprocessor.split_length, 500);
        assert_eq!(config.store.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(
            &path,
            r#"
update_existing_embeddings = true

[preprocessor]
split_by = "sentence"
split_length = 5

[store]
port = 9090
embedding_dim = 384
"#,
        )
        .unwrap();

        let config = IngestConfig::load(Some(&path)).unwrap();
        assert!(config.update_existing_embeddings);
        assert_eq!(config.preprocessor.split_by, SplitBy::Sentence);
        assert_eq!(config.preprocessor.split_length, 5);
        assert!(config.preprocessor.clean_header_footer);
        assert_eq!(config.store.port, 9090);
        assert_eq!(config.store.embedding_dim, 384);
        assert_eq!(config.store.index, "Document");
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(&path, "[preprocessor]\nsplit_length = 0\n").unwrap();

        assert!(matches!(
            IngestConfig::load(Some(&path)),
            Err(IngestError::Validation(_))
        ));
        assert!(IngestConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
