use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::alb_log::parse_timestamp;

/// Field every indexed log document carries its timestamp under.
pub const TIMESTAMP_FIELD: &str = "log.timestamp";

/// A document queued for a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDocument {
    pub index: String,
    pub id: Option<String>,
    pub source: Value,
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("index '{index}' answered {status}: {body}")]
    Status {
        index: String,
        status: u16,
        body: String,
    },
    #[error("bulk write rejected {failed} of {total} documents: {first_reason}")]
    BulkRejected {
        failed: usize,
        total: usize,
        first_reason: String,
    },
    #[error("unexpected response from index: {0}")]
    Malformed(String),
}

/// The calls the ingestor makes against a search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn exists(&self, index: &str) -> Result<bool, IndexError>;

    async fn create(&self, index: &str, mapping: &Value) -> Result<(), IndexError>;

    /// Timestamp of the newest document, `None` if the index is empty or missing.
    async fn latest_timestamp(&self, index: &str) -> Result<Option<DateTime<Utc>>, IndexError>;

    /// Submits all documents in one request and returns how many were written.
    async fn bulk(&self, documents: Vec<BulkDocument>) -> Result<usize, IndexError>;
}

/// Elasticsearch (or OpenSearch) over its REST API.
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    host: String,
    credentials: Option<(String, String)>,
}

impl ElasticsearchIndex {
    pub fn new(host: &str, credentials: Option<(String, String)>) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(ElasticsearchIndex {
            client,
            host: host.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.host, path.trim_start_matches('/')));
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }
}

async fn status_error(index: &str, resp: reqwest::Response) -> IndexError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    IndexError::Status {
        index: index.to_string(),
        status,
        body,
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: Value,
}

#[derive(Deserialize)]
struct BulkResponse {
    errors: bool,
    items: Vec<Value>,
}

/// Pulls a dotted field such as `log.timestamp` out of a document.
fn lookup<'a>(doc: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(doc, |value, key| value.get(key))
}

fn bulk_body(documents: &[BulkDocument]) -> Result<String, IndexError> {
    let mut body = String::new();
    for doc in documents {
        let action = match &doc.id {
            Some(id) => json!({"index": {"_index": doc.index, "_id": id}}),
            None => json!({"index": {"_index": doc.index}}),
        };
        body.push_str(&action.to_string());
        body.push('\n');
        let source = serde_json::to_string(&doc.source)
            .map_err(|e| IndexError::Malformed(format!("unserializable document: {}", e)))?;
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

fn bulk_result(response: BulkResponse, total: usize) -> Result<usize, IndexError> {
    if !response.errors {
        return Ok(total);
    }
    let failures: Vec<&Value> = response
        .items
        .iter()
        .filter_map(|item| item.get("index"))
        .filter(|result| result.get("error").is_some())
        .collect();
    let first_reason = failures
        .first()
        .and_then(|f| f.get("error"))
        .map(|e| e.to_string())
        .unwrap_or_default();
    Err(IndexError::BulkRejected {
        failed: failures.len(),
        total,
        first_reason,
    })
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn exists(&self, index: &str) -> Result<bool, IndexError> {
        let resp = self.request(reqwest::Method::HEAD, index).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(status_error(index, resp).await),
        }
    }

    async fn create(&self, index: &str, mapping: &Value) -> Result<(), IndexError> {
        let resp = self
            .request(reqwest::Method::PUT, index)
            .json(mapping)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(index, resp).await);
        }
        Ok(())
    }

    async fn latest_timestamp(&self, index: &str) -> Result<Option<DateTime<Utc>>, IndexError> {
        let query = json!({
            "size": 1,
            "sort": [{TIMESTAMP_FIELD: {"order": "desc"}}],
            "_source": [TIMESTAMP_FIELD],
        });
        let resp = self
            .request(reqwest::Method::POST, &format!("{}/_search", index))
            .json(&query)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(index, resp).await);
        }

        let response: SearchResponse = resp.json().await?;
        let Some(hit) = response.hits.hits.first() else {
            return Ok(None);
        };
        let raw = lookup(&hit.source, TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| IndexError::Malformed(format!("newest hit has no {}", TIMESTAMP_FIELD)))?;
        parse_timestamp(raw)
            .map(Some)
            .ok_or_else(|| IndexError::Malformed(format!("unparseable timestamp '{}'", raw)))
    }

    async fn bulk(&self, documents: Vec<BulkDocument>) -> Result<usize, IndexError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let total = documents.len();
        let body = bulk_body(&documents)?;

        let resp = self
            .request(reqwest::Method::POST, "_bulk?refresh=wait_for")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("_bulk", resp).await);
        }
        let response: BulkResponse = resp.json().await?;
        bulk_result(response, total)
    }
}

/// In-process index keyed by index name, then document id.
///
/// Documents without an id get a sequential one, like the server would
/// generate. `fail_queries` makes `latest_timestamp` error out.
#[derive(Default)]
pub struct MemoryIndex {
    indices: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    next_id: Mutex<u64>,
    fail_queries: bool,
    bulk_calls: Mutex<usize>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_queries() -> Self {
        MemoryIndex {
            fail_queries: true,
            ..Self::default()
        }
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .map_or(0, |docs| docs.len())
    }

    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bulk_calls(&self) -> usize {
        *self.bulk_calls.lock().unwrap()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn exists(&self, index: &str) -> Result<bool, IndexError> {
        Ok(self.indices.lock().unwrap().contains_key(index))
    }

    async fn create(&self, index: &str, _mapping: &Value) -> Result<(), IndexError> {
        self.indices
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default();
        Ok(())
    }

    async fn latest_timestamp(&self, index: &str) -> Result<Option<DateTime<Utc>>, IndexError> {
        if self.fail_queries {
            return Err(IndexError::Status {
                index: index.to_string(),
                status: 503,
                body: "search unavailable".to_string(),
            });
        }
        let indices = self.indices.lock().unwrap();
        let Some(docs) = indices.get(index) else {
            return Ok(None);
        };
        Ok(docs
            .values()
            .filter_map(|doc| lookup(doc, TIMESTAMP_FIELD))
            .filter_map(Value::as_str)
            .filter_map(parse_timestamp)
            .max())
    }

    async fn bulk(&self, documents: Vec<BulkDocument>) -> Result<usize, IndexError> {
        *self.bulk_calls.lock().unwrap() += 1;
        let total = documents.len();
        let mut indices = self.indices.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        for doc in documents {
            let id = doc.id.unwrap_or_else(|| {
                *next_id += 1;
                format!("auto-{}", next_id)
            });
            indices.entry(doc.index).or_default().insert(id, doc.source);
        }
        Ok(total)
    }
}
