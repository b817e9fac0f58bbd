// HTTP client for the external memory store
//
// POST {base_url}/batch with {"items": [...]}, answered by {"stored_ids": [...]}.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error};

use super::store::{MemoryItem, MemoryStore, StoreReceipt};
use crate::error::{OrchestratorError, Result};

#[derive(Serialize)]
struct BatchRequest<'a> {
    items: &'a [MemoryItem],
}

/// Memory store reached over HTTP
pub struct HttpMemoryStore {
    base_url: String,
    client: Client,
}

impl HttpMemoryStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Build from `SHOAL_MEMORY_STORE_URL`, if set
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("SHOAL_MEMORY_STORE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()).map(Some),
            _ => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MemoryStore for HttpMemoryStore {
    async fn batch_store(&self, items: Vec<MemoryItem>) -> Result<StoreReceipt> {
        if items.is_empty() {
            return Ok(StoreReceipt::default());
        }

        let url = format!("{}/batch", self.base_url);
        debug!(url = %url, batch_size = items.len(), "Sending batch to memory store");

        let response = self
            .client
            .post(&url)
            .json(&BatchRequest { items: &items })
            .send()
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, body = %body, "Memory store rejected batch");
            return Err(OrchestratorError::Store(format!("HTTP {status}: {body}")));
        }

        response
            .json::<StoreReceipt>()
            .await
            .map_err(|e| OrchestratorError::Store(format!("invalid store response: {e}")))
    }

    fn name(&self) -> &'static str {
        "HttpMemoryStore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolId, TaskId};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(id: &str) -> MemoryItem {
        MemoryItem {
            id: id.to_string(),
            pool_id: PoolId::from("gpu"),
            task_id: TaskId::new(),
            content: json!({"answer": 42}),
            duration_ms: 12,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_posts_batch_and_reads_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"stored_ids": ["gpu/1"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpMemoryStore::new(&format!("{}/", server.uri())).unwrap();
        let receipt = store
            .batch_store(vec![item("gpu/1"), item("gpu/2")])
            .await
            .unwrap();
        assert_eq!(receipt.stored_ids, vec!["gpu/1"]);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["items"][1]["id"], "gpu/2");
        assert_eq!(body["items"][0]["content"]["answer"], 42);
    }

    #[tokio::test]
    async fn test_server_error_is_store_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let store = HttpMemoryStore::new(&server.uri()).unwrap();
        let err = store.batch_store(vec![item("gpu/1")]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(ref m) if m.contains("503")));
        assert!(err.counts_against_target());
    }

    #[tokio::test]
    async fn test_malformed_response_is_store_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let store = HttpMemoryStore::new(&server.uri()).unwrap();
        let err = store.batch_store(vec![item("gpu/1")]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let store = HttpMemoryStore::new(&server.uri()).unwrap();
        assert!(store.batch_store(Vec::new()).await.unwrap().stored_ids.is_empty());
    }
}
