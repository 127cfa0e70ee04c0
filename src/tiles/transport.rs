//! # Tile Transport
//!
//! Fetches tile images from a slippy-map tile server. Response bodies are
//! treated as opaque bytes.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use super::key::TileKey;
use crate::error::{AgentError, Result};

/// Source of tile bytes.
#[async_trait]
pub trait TileTransport: Send + Sync {
    /// Downloads one tile.
    async fn fetch(&self, key: &TileKey) -> Result<Bytes>;
}

/// HTTP tile transport: `GET {base_url}/{zoom}/{x}/{y}.png`.
#[derive(Debug, Clone)]
pub struct HttpTileTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTileTransport {
    /// Creates a transport with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Http`] if the client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("recon-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// URL of a tile on the configured server.
    pub fn url_for(&self, key: &TileKey) -> String {
        format!("{}/{}/{}/{}.png", self.base_url, key.zoom, key.x, key.y)
    }
}

#[async_trait]
impl TileTransport for HttpTileTransport {
    async fn fetch(&self, key: &TileKey) -> Result<Bytes> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("Request for {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!("HTTP {} from {}", status, url)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::Transport(format!("Failed to read {}: {}", url, e)))?;

        if body.is_empty() {
            return Err(AgentError::Transport(format!("Empty tile body from {}", url)));
        }

        debug!(tile = %key, bytes = body.len(), "Tile downloaded");
        Ok(body)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_layout_strips_trailing_slash() {
        let transport =
            HttpTileTransport::new("https://tile.example.org/", Duration::from_secs(5)).unwrap();
        let key = TileKey::new(16, 19295, 24640).unwrap();
        assert_eq!(
            transport.url_for(&key),
            "https://tile.example.org/16/19295/24640.png"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let transport =
            HttpTileTransport::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let key = TileKey::new(1, 0, 0).unwrap();
        match transport.fetch(&key).await {
            Err(AgentError::Transport(msg)) => assert!(msg.contains("1/0/0")),
            other => panic!("Expected Transport error, got: {:?}", other),
        }
    }
}
