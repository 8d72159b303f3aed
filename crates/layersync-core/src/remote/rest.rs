//! PostgREST client
//!
//! Maps the [`RemoteStore`] contract onto PostgREST conventions:
//! `GET /layers`, `GET /points?layer_id=eq.<id>`, bulk `POST /points`,
//! upserts with `on_conflict=id`, `DELETE /points?id=in.(...)` and
//! `POST /rpc/merge_sub_layer`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::debug;

use super::RemoteStore;
use crate::error::RemoteError;
use crate::models::{LayerAttribute, LayerId, LayerInfo, RemoteFeature, RemoteId};

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for full layer downloads
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the REST endpoint
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL, e.g. `http://localhost:8000/rest/v1`
    pub url: String,
    /// Project key sent as `apikey`
    pub api_key: String,
    /// User token; the project key is used when absent
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl RestConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            access_token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct RestClient {
    config: RestConfig,
    client: Client,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(concat!("layersync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), path);
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);

        self.client
            .request(method, url)
            .timeout(self.config.timeout)
            .bearer_auth(token)
            .header("apikey", &self.config.api_key)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await?;
        check_status(response).await
    }
}

/// Turn a non-success response into `RemoteError::Status`
///
/// JSON error bodies carry a `message` field; other bodies are used as-is.
async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    let body = response.text().await.unwrap_or_default();

    let message = if is_json {
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body)
    } else {
        body
    };

    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

fn in_list(ids: &[RemoteId]) -> String {
    let joined: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("in.({})", joined.join(","))
}

#[async_trait]
impl RemoteStore for RestClient {
    async fn list_layers(&self) -> Result<Vec<LayerInfo>, RemoteError> {
        let response = self.send(self.request(Method::GET, "layers")).await?;
        let mut layers: Vec<LayerInfo> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }

    async fn get_layer(&self, id: LayerId) -> Result<LayerInfo, RemoteError> {
        let builder = self
            .request(Method::GET, "layers")
            .query(&[("id", format!("eq.{}", id))]);
        let layers: Vec<LayerInfo> = self
            .send(builder)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        layers
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(format!("layer {}", id)))
    }

    async fn fetch_features(&self, layer: LayerId) -> Result<Vec<RemoteFeature>, RemoteError> {
        let builder = self
            .request(Method::GET, "points")
            .query(&[("layer_id", format!("eq.{}", layer))])
            .timeout(FETCH_TIMEOUT);
        let rows: Vec<RemoteFeature> = self
            .send(builder)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        debug!("Fetched {} feature(s) of layer {}", rows.len(), layer);
        Ok(rows)
    }

    async fn insert_features(&self, rows: &[RemoteFeature]) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let builder = self
            .request(Method::POST, "points")
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(builder).await?;
        Ok(())
    }

    async fn update_features(&self, rows: &[RemoteFeature]) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let builder = self
            .request(Method::POST, "points")
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(builder).await?;
        Ok(())
    }

    async fn delete_features(&self, ids: &[RemoteId]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let builder = self
            .request(Method::DELETE, "points")
            .query(&[("id", in_list(ids))]);
        self.send(builder).await?;
        Ok(())
    }

    async fn create_layer(&self, layer: &LayerInfo) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::POST, "layers")
            .header("Prefer", "return=minimal")
            .json(layer);
        self.send(builder).await?;
        Ok(())
    }

    async fn drop_layer(&self, id: LayerId) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::DELETE, "layers")
            .query(&[("id", format!("eq.{}", id))]);
        self.send(builder).await?;
        Ok(())
    }

    async fn rename_layer(&self, id: LayerId, name: &str) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::PATCH, "layers")
            .query(&[("id", format!("eq.{}", id))])
            .json(&json!({ "name": name }));
        self.send(builder).await?;
        Ok(())
    }

    async fn update_layer_attributes(
        &self,
        id: LayerId,
        attributes: &[LayerAttribute],
    ) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::PATCH, "layers")
            .query(&[("id", format!("eq.{}", id))])
            .json(&json!({ "attributes": attributes }));
        self.send(builder).await?;
        Ok(())
    }

    async fn merge_sub_layer(&self, sub_layer: LayerId) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::POST, "rpc/merge_sub_layer")
            .json(&json!({ "sub_layer_id": sub_layer }));
        self.send(builder).await?;
        Ok(())
    }
}
