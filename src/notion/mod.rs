use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::debug;

const NOTION_API_BASE: &str = "https://api.notion.com/";

#[derive(Debug, Error)]
pub enum NotionError {
    #[error("failed to reach Notion: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("received 429 from Notion: {0}")]
    RateLimited(String),
    #[error("notion error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid Notion URL: {0}")]
    Url(String),
}

impl NotionError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, NotionError::RateLimited(_))
    }
}

/// Write side of the sync. The engine only needs lookup-by-key, create and
/// update; tests substitute a recording fake.
#[async_trait]
pub trait NotionStore: Send + Sync {
    /// Find the page whose `property` title equals `key`. At most one page
    /// per key exists by construction, so a single-result query suffices.
    async fn query_page_by_key(
        &self,
        database_id: &str,
        property: &str,
        key: &str,
    ) -> Result<Option<String>, NotionError>;

    async fn create_page(
        &self,
        database_id: &str,
        properties: Map<String, Value>,
    ) -> Result<String, NotionError>;

    async fn update_page(
        &self,
        page_id: &str,
        properties: Map<String, Value>,
    ) -> Result<String, NotionError>;
}

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    pub fn new(token: String, version: String) -> Self {
        let base_url = Url::parse(NOTION_API_BASE).expect("valid default Notion URL");
        Self::with_base_url(token, version, base_url)
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("gitlab-notion-sync/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            version,
        }
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<reqwest::Request, NotionError> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|e| NotionError::Url(e.to_string()))?;
        self.http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version)
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .map_err(NotionError::from)
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<T, NotionError> {
        let request = self.build_request(method, path, &body)?;
        debug!(url = %request.url(), payload = %body, "sending notion request");
        let res = self.http.execute(request).await?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(NotionError::RateLimited(body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(NotionError::Api { status, body });
        }

        Ok(res.json::<T>().await?)
    }
}

#[async_trait]
impl NotionStore for NotionClient {
    async fn query_page_by_key(
        &self,
        database_id: &str,
        property: &str,
        key: &str,
    ) -> Result<Option<String>, NotionError> {
        let body = build_key_query(property, key);
        let payload: QueryResponse = self
            .execute(
                Method::POST,
                &format!("v1/databases/{}/query", database_id),
                body,
            )
            .await?;
        Ok(payload.results.into_iter().next().map(|page| page.id))
    }

    async fn create_page(
        &self,
        database_id: &str,
        properties: Map<String, Value>,
    ) -> Result<String, NotionError> {
        let body = build_create_page_request(database_id, properties);
        let payload: PageRef = self.execute(Method::POST, "v1/pages", body).await?;
        Ok(payload.id)
    }

    async fn update_page(
        &self,
        page_id: &str,
        properties: Map<String, Value>,
    ) -> Result<String, NotionError> {
        let body = json!({ "properties": Value::Object(properties) });
        let payload: PageRef = self
            .execute(Method::PATCH, &format!("v1/pages/{}", page_id), body)
            .await?;
        Ok(payload.id)
    }
}

/// Single-result query matching the key property's title exactly.
pub fn build_key_query(property: &str, key: &str) -> Value {
    json!({
        "filter": {
            "property": property,
            "title": { "equals": key }
        },
        "page_size": 1
    })
}

pub fn build_create_page_request(database_id: &str, properties: Map<String, Value>) -> Value {
    json!({
        "parent": { "database_id": database_id },
        "properties": Value::Object(properties),
    })
}

#[derive(Deserialize)]
struct PageRef {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    results: Vec<PageRef>,
}
