use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::store::check_dimension;
use super::{Document, DocumentStore, IngestError, IngestResult};

const CONTENT_PROPERTY: &str = "content";
const META_PROPERTY: &str = "meta_json";

/// Connection and schema settings for a Weaviate instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaviateConfig {
    /// Scheme and host, e.g. `http://localhost`
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Weaviate class documents are stored in
    pub index: String,
    /// Length of stored vectors
    pub embedding_dim: usize,
    /// Objects per batch write and per page when listing
    pub batch_size: usize,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for WeaviateConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            port: 8080,
            index: "Document".to_string(),
            embedding_dim: 768,
            batch_size: 100,
            timeout_secs: 30,
        }
    }
}

impl WeaviateConfig {
    /// Reject class names Weaviate would refuse and zero sizes
    pub fn validate(&self) -> IngestResult<()> {
        if !self.index.starts_with(|c: char| c.is_ascii_uppercase())
            || !self.index.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(IngestError::Validation(format!(
                "index '{}' must be a Weaviate class name starting with an uppercase letter",
                self.index
            )));
        }
        if self.embedding_dim == 0 || self.batch_size == 0 {
            return Err(IngestError::Validation(
                "embedding_dim and batch_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Host and port joined, without a trailing slash
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

/// Document store backed by a Weaviate instance over its REST and GraphQL APIs
pub struct WeaviateDocumentStore {
    client: Client,
    config: WeaviateConfig,
    base_url: String,
}

impl WeaviateDocumentStore {
    /// Connect and create the document class if it does not exist yet
    pub async fn connect(config: WeaviateConfig) -> IngestResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let store = Self {
            client,
            base_url: config.base_url(),
            config,
        };
        store.ensure_schema().await?;

        info!(url = %store.base_url, index = %store.config.index, "Connected to Weaviate");
        Ok(store)
    }

    /// Settings the store was connected with
    pub fn config(&self) -> &WeaviateConfig {
        &self.config
    }

    async fn ensure_schema(&self) -> IngestResult<()> {
        let url = format!("{}/v1/schema/{}", self.base_url, self.config.index);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            status if status.is_success() => {
                debug!(index = %self.config.index, "Weaviate class exists");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                self.client
                    .post(format!("{}/v1/schema", self.base_url))
                    .json(&class_definition(&self.config.index))
                    .send()
                    .await?
                    .error_for_status()?;
                info!(index = %self.config.index, "Created Weaviate class");
                Ok(())
            }
            status => Err(IngestError::Store(format!(
                "schema lookup for {} failed with status {}",
                self.config.index, status
            ))),
        }
    }

    async fn graphql(&self, query: String) -> IngestResult<Value> {
        let body: Value = self
            .client
            .post(format!("{}/v1/graphql", self.base_url))
            .json(&json!({ "query": query }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        graphql_data(body)
    }
}

#[async_trait]
impl DocumentStore for WeaviateDocumentStore {
    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    async fn write_documents(&self, documents: Vec<Document>) -> IngestResult<usize> {
        for doc in &documents {
            if let Some(embedding) = &doc.embedding {
                check_dimension(self.config.embedding_dim, embedding.len(), "document embedding")?;
            }
        }

        for batch in documents.chunks(self.config.batch_size) {
            let objects: Vec<Value> = batch
                .iter()
                .map(|doc| to_object(&self.config.index, doc))
                .collect::<IngestResult<_>>()?;

            let response: Value = self
                .client
                .post(format!("{}/v1/batch/objects", self.base_url))
                .json(&json!({ "objects": objects }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let errors = batch_errors(&response);
            if !errors.is_empty() {
                return Err(IngestError::Store(format!(
                    "batch write rejected {} objects: {}",
                    errors.len(),
                    errors.join("; ")
                )));
            }
            debug!(count = batch.len(), "Wrote batch to Weaviate");
        }

        Ok(documents.len())
    }

    async fn get_all_documents(&self) -> IngestResult<Vec<Document>> {
        let limit = self.config.batch_size.to_string();
        let mut documents = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/v1/objects", self.base_url))
                .query(&[
                    ("class", self.config.index.as_str()),
                    ("limit", limit.as_str()),
                    ("include", "vector"),
                ]);
            if let Some(after) = &after {
                request = request.query(&[("after", after.as_str())]);
            }

            let page: Value = request.send().await?.error_for_status()?.json().await?;
            let objects = page
                .get("objects")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for object in objects {
                documents.push(from_object(object)?);
            }

            if objects.len() < self.config.batch_size {
                break;
            }
            after = documents.last().map(|doc| doc.id.clone());
        }

        Ok(documents)
    }

    async fn get_document_count(&self) -> IngestResult<usize> {
        let data = self.graphql(count_query(&self.config.index)).await?;
        data["Aggregate"][&self.config.index][0]["meta"]["count"]
            .as_u64()
            .map(|count| count as usize)
            .ok_or_else(|| IngestError::Store("aggregate response carried no count".into()))
    }

    async fn query_by_embedding(&self, query: &[f32], top_k: usize) -> IngestResult<Vec<Document>> {
        check_dimension(self.config.embedding_dim, query.len(), "query")?;

        let data = self
            .graphql(near_vector_query(&self.config.index, query, top_k)?)
            .await?;
        data["Get"][&self.config.index]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(from_graphql_hit)
            .collect()
    }
}

fn class_definition(index: &str) -> Value {
    json!({
        "class": index,
        "vectorizer": "none",
        "vectorIndexConfig": { "distance": "cosine" },
        "properties": [
            { "name": CONTENT_PROPERTY, "dataType": ["text"] },
            { "name": META_PROPERTY, "dataType": ["text"] },
        ],
    })
}

fn to_object(index: &str, doc: &Document) -> IngestResult<Value> {
    let mut object = json!({
        "class": index,
        "id": doc.id,
        "properties": {
            CONTENT_PROPERTY: doc.content,
            META_PROPERTY: serde_json::to_string(&doc.meta)?,
        },
    });
    if let Some(embedding) = &doc.embedding {
        object["vector"] = json!(embedding);
    }
    Ok(object)
}

fn parse_meta(value: &Value) -> IngestResult<Map<String, Value>> {
    match value.as_str() {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(Map::new()),
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    let values = value.as_array()?;
    if values.is_empty() {
        return None;
    }
    values.iter().map(|v| v.as_f64().map(|f| f as f32)).collect()
}

fn from_object(object: &Value) -> IngestResult<Document> {
    let id = object["id"]
        .as_str()
        .ok_or_else(|| IngestError::Store("object without id".into()))?;
    let properties = &object["properties"];

    Ok(Document {
        id: id.to_string(),
        content: properties[CONTENT_PROPERTY].as_str().unwrap_or_default().to_string(),
        meta: parse_meta(&properties[META_PROPERTY])?,
        embedding: parse_vector(&object["vector"]),
        score: None,
    })
}

fn from_graphql_hit(hit: &Value) -> IngestResult<Document> {
    let additional = &hit["_additional"];
    let id = additional["id"]
        .as_str()
        .ok_or_else(|| IngestError::Store("search hit without id".into()))?;

    Ok(Document {
        id: id.to_string(),
        content: hit[CONTENT_PROPERTY].as_str().unwrap_or_default().to_string(),
        meta: parse_meta(&hit[META_PROPERTY])?,
        embedding: parse_vector(&additional["vector"]),
        score: additional["certainty"].as_f64().map(|c| c as f32),
    })
}

fn near_vector_query(index: &str, vector: &[f32], top_k: usize) -> IngestResult<String> {
    Ok(format!(
        "{{ Get {{ {index}(nearVector: {{vector: {}}}, limit: {top_k}) {{ {CONTENT_PROPERTY} {META_PROPERTY} _additional {{ id certainty vector }} }} }} }}",
        serde_json::to_string(vector)?
    ))
}

fn count_query(index: &str) -> String {
    format!("{{ Aggregate {{ {index} {{ meta {{ count }} }} }} }}")
}

fn graphql_data(mut body: Value) -> IngestResult<Value> {
    if let Some(errors) = body.get("errors").filter(|errors| !errors.is_null()) {
        return Err(IngestError::Store(format!("GraphQL query failed: {}", errors)));
    }
    Ok(body["data"].take())
}

/// Error messages reported for individual objects of a batch write
fn batch_errors(response: &Value) -> Vec<String> {
    response
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .flat_map(|item| {
            item["result"]["errors"]["error"]
                .as_array()
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .filter_map(|error| error["message"].as_str().map(str::to_owned))
                .collect::<Vec<_>>()
        })
        .collect()
}
