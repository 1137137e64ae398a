//! Request/response wrapper around the backend Command API. Exactly one
//! HTTP request per call; failures come back typed and are never retried.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CommandError, ErrorResponse};
use crate::types::{
    CodePackage, Migration, MigrationRequest, Node, NodeMetrics, Topology, UploadCodeRequest,
};

/// The one Command API operation the batch orchestrator needs.
#[async_trait]
pub trait MigrationLauncher: Send + Sync {
    async fn launch(&self, request: &MigrationRequest) -> Result<Migration, CommandError>;
}

#[derive(Clone)]
pub struct CommandClient {
    base_url: Url,
    http: reqwest::Client,
    user_agent: String,
}

impl CommandClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("Invalid base URL")?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Base URL {} cannot carry a path", base_url);
        }
        // Path segments are appended, so the base must not end in an empty segment.
        let trimmed = base_url.path().trim_end_matches('/').to_string();
        base_url.set_path(&trimmed);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            http,
            user_agent: format!("migration-console/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append `segments` to the base path, percent-encoding each one.
    pub fn build_url(&self, segments: &[&str]) -> Result<Url, CommandError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CommandError::InvalidUrl {
                path: segments.join("/"),
                reason: format!("base URL {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // ============================================================================
    // Nodes
    // ============================================================================

    pub async fn list_nodes(&self) -> Result<Vec<Node>, CommandError> {
        self.get(&["nodes"]).await
    }

    pub async fn topology(&self) -> Result<Topology, CommandError> {
        self.get(&["nodes", "topology"]).await
    }

    pub async fn node_metrics(&self, node_id: &str) -> Result<NodeMetrics, CommandError> {
        self.get(&["nodes", node_id, "metrics"]).await
    }

    // ============================================================================
    // Migrations
    // ============================================================================

    pub async fn create_migration(
        &self,
        request: &MigrationRequest,
    ) -> Result<Migration, CommandError> {
        self.send(Method::POST, &["migrations"], Some(request)).await
    }

    pub async fn get_migration(&self, migration_id: &str) -> Result<Migration, CommandError> {
        self.get(&["migrations", migration_id]).await
    }

    pub async fn list_migrations(&self) -> Result<Vec<Migration>, CommandError> {
        self.get(&["migrations"]).await
    }

    pub async fn cancel_migration(&self, migration_id: &str) -> Result<Migration, CommandError> {
        self.send::<(), _>(Method::POST, &["migrations", migration_id, "cancel"], None)
            .await
    }

    // ============================================================================
    // Code
    // ============================================================================

    pub async fn upload_code(&self, request: &UploadCodeRequest) -> Result<CodePackage, CommandError> {
        self.send(Method::POST, &["code"], Some(request)).await
    }

    pub async fn get_code(&self, code_id: &str) -> Result<CodePackage, CommandError> {
        self.get(&["code", code_id]).await
    }

    pub async fn list_code(&self) -> Result<Vec<CodePackage>, CommandError> {
        self.get(&["code"]).await
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, CommandError> {
        self.send::<(), T>(Method::GET, segments, None).await
    }

    async fn send<B, T>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<T, CommandError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(segments)?;
        let req_id = Uuid::new_v4().to_string();

        let mut req = self.http.request(method.clone(), url.clone());
        req = req.header("user-agent", &self.user_agent);
        req = req.header("x-request-id", &req_id);
        if let Some(b) = body {
            req = req.json(b);
        }

        debug!("HTTP {} {} (request {})", method, url, req_id);
        let transport = |source: reqwest::Error| CommandError::Transport {
            method: method.to_string(),
            url: url.to_string(),
            source,
        };

        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(transport)?;

        if !status.is_success() {
            // Prefer the structured error body, fall back to raw text.
            let message = serde_json::from_slice::<ErrorResponse>(&bytes)
                .ok()
                .and_then(|e| e.best_message().map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).trim().to_string());
            debug!("HTTP {} {} -> {} {}", method, url, status.as_u16(), message);
            return Err(CommandError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|source| CommandError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl MigrationLauncher for CommandClient {
    async fn launch(&self, request: &MigrationRequest) -> Result<Migration, CommandError> {
        self.create_migration(request).await
    }
}
