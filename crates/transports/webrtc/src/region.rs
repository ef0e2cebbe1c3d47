//! Multi-region endpoint selection
//!
//! Deployments with geographic failover expose a settings endpoint listing
//! candidate session endpoints ordered by distance. When a full reconnect
//! fails, the engine asks an [`EndpointProvider`] for the next candidate
//! before giving up.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Supplies alternate session endpoints for connection failover
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    /// Next endpoint to try, or `None` when the candidates are exhausted
    async fn next_url(&self) -> Option<String>;

    /// Record that connecting to `url` failed; the rotation moves past it
    async fn report_failure(&self, url: &str);
}

/// One region entry from the settings endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RegionInfo {
    /// Region identifier
    pub region: String,
    /// Session endpoint url for this region
    pub url: String,
    /// Estimated distance, smaller is closer
    pub distance: i64,
}

#[derive(Debug, Deserialize)]
struct RegionSettings {
    regions: Vec<RegionInfo>,
}

/// [`EndpointProvider`] backed by the `/settings/regions` discovery endpoint
pub struct RegionEndpointProvider {
    client: reqwest::Client,
    settings_url: Url,
    token: String,
    regions: Mutex<Vec<RegionInfo>>,
    /// Endpoints reported failed; excluded from further rotation
    failed: Mutex<HashSet<String>>,
}

impl RegionEndpointProvider {
    /// Create a provider for the given session endpoint and access token.
    ///
    /// `server_url` is the original ws(s) endpoint; the settings endpoint is
    /// derived from it by switching to http(s).
    pub fn new(server_url: &str, token: &str) -> Result<Self> {
        let mut settings_url = Url::parse(server_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid server url: {e}")))?;

        let scheme = match settings_url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported url scheme: {other}"
                )))
            }
        };
        // set_scheme only fails for degenerate urls already rejected above
        let _ = settings_url.set_scheme(scheme);
        settings_url.set_path("/settings/regions");
        settings_url.set_query(None);

        Ok(Self {
            client: reqwest::Client::new(),
            settings_url,
            token: token.to_string(),
            regions: Mutex::new(Vec::new()),
            failed: Mutex::new(HashSet::new()),
        })
    }

    async fn fetch_regions(&self) -> Result<Vec<RegionInfo>> {
        let response = self
            .client
            .get(self.settings_url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::ServerUnreachable(format!("region discovery failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Signaling(format!(
                "region discovery returned {}",
                response.status()
            )));
        }

        let mut settings: RegionSettings = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("invalid region settings: {e}")))?;

        settings.regions.sort_by_key(|r| r.distance);
        Ok(settings.regions)
    }
}

#[async_trait]
impl EndpointProvider for RegionEndpointProvider {
    async fn next_url(&self) -> Option<String> {
        if self.regions.lock().is_empty() {
            match self.fetch_regions().await {
                Ok(regions) => {
                    debug!("discovered {} candidate regions", regions.len());
                    *self.regions.lock() = regions;
                }
                Err(e) => {
                    warn!("could not discover regions: {e}");
                    return None;
                }
            }
        }

        let regions = self.regions.lock();
        let failed = self.failed.lock();
        for region in regions.iter() {
            if !failed.contains(&region.url) {
                debug!("failing over to region {} at {}", region.region, region.url);
                return Some(region.url.clone());
            }
        }

        None
    }

    async fn report_failure(&self, url: &str) {
        debug!(url, "endpoint reported failed");
        self.failed.lock().insert(url.to_string());
    }
}
