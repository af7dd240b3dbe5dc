//! HTTP client for the disk probe

use super::{DiskUsageResponse, UsageClient, DISK_PATH, PROBE_PORT};
use crate::error::FetchError;
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

/// Queries probes over plain HTTP
#[derive(Debug, Clone)]
pub struct HttpUsageClient {
    client: Client,
    port: u16,
}

impl HttpUsageClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            port: PROBE_PORT,
        }
    }

    /// Override the probe port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Build the probe URL for an address such as `http://10.0.0.1`
    fn probe_url(&self, address: &str) -> Result<Url, FetchError> {
        let mut url = Url::parse(address)?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(FetchError::MissingHost(address.to_string()));
        }
        url.set_port(Some(self.port))
            .map_err(|_| FetchError::MissingHost(address.to_string()))?;
        url.set_path(DISK_PATH);
        Ok(url)
    }
}

impl Default for HttpUsageClient {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl UsageClient for HttpUsageClient {
    async fn disk_usage(&self, address: &str) -> Result<Vec<DiskUsageResponse>, FetchError> {
        let url = self.probe_url(address)?;

        // A 500 still carries the mounts that could be read, so the status is not checked
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::Request)?;
        let body = response.bytes().await.map_err(FetchError::Request)?;

        let entries: Vec<DiskUsageResponse> =
            serde_json::from_slice(&body).map_err(FetchError::MalformedBody)?;
        let usable: Vec<_> = entries.into_iter().filter(|e| e.is_usable()).collect();

        if usable.is_empty() {
            return Err(FetchError::NoUsableData);
        }
        Ok(usable)
    }
}
