use crate::error::{PlatformError, Result};
use crate::traits::RemoteClusterClient;
use async_trait::async_trait;
use cirrus_core::ApiEndpoint;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Talks to a workload cluster's API server over HTTPS
pub struct HttpRemoteClusterClient {
    client: Client,
    bearer_token: Option<String>,
}

impl HttpRemoteClusterClient {
    /// Build a client. `accept_invalid_certs` is required while a workload
    /// cluster still serves its bootstrap self-signed certificate.
    pub fn new(accept_invalid_certs: bool, bearer_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                PlatformError::remote_cluster(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            bearer_token,
        })
    }

    fn base_url(endpoint: &ApiEndpoint) -> String {
        format!("https://{}:{}", endpoint.host, endpoint.port)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteClusterClient for HttpRemoteClusterClient {
    /// GET /version
    async fn is_api_server_online(&self, endpoint: &ApiEndpoint) -> bool {
        if endpoint.is_zero() {
            return false;
        }
        let url = format!("{}/version", Self::base_url(endpoint));
        debug!("GET {}", url);

        match self.authorize(self.client.get(&url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("API server {} not reachable yet: {}", url, e);
                false
            }
        }
    }

    /// DELETE /api/v1/nodes/{name}
    async fn delete_node(&self, endpoint: &ApiEndpoint, node_name: &str) -> Result<()> {
        let url = format!("{}/api/v1/nodes/{}", Self::base_url(endpoint), node_name);
        debug!("DELETE {}", url);

        let resp = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| PlatformError::remote_cluster(format!("HTTP request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PlatformError::remote_cluster(format!(
            "DELETE node {} failed with status {}: {}",
            node_name, status, body
        )))
    }
}
