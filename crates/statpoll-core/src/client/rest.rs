//! REST transport for the cluster statistics API.
//!
//! Talks to `https://<address>:8080/platform/1/...` with basic auth. SSL
//! verification can be disabled for clusters with self-signed certificates.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{ClientError, KeysPage, StatsApi};
use crate::stats::{Stat, StatMetadata};

/// Default platform API port.
const API_PORT: u16 = 8080;

/// Connect timeout for every request. Query timeouts are passed per call on
/// top of this.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    stats: Vec<Stat>,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keys: Vec<StatMetadata>,
    #[serde(default)]
    resume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClusterConfigResponse {
    version: VersionInfo,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    release: String,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    name: String,
}

/// [`StatsApi`] implementation over the cluster's REST endpoints.
pub struct RestStatsApi {
    http: reqwest::blocking::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestStatsApi {
    pub fn new(
        address: &str,
        username: &str,
        password: &str,
        verify_ssl: bool,
    ) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Unexpected(format!("failed to build HTTP client: {}", e)))?;
        Ok(RestStatsApi {
            http,
            base_url: format!("https://{}:{}", address, API_PORT),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Queries the cluster's release string and maps it onto the statistics
    /// protocol generation: anything in the v7 line speaks the single-key
    /// protocol (7.2), everything newer the batch protocol (8.0).
    pub fn detect_version(&self) -> Result<f64, ClientError> {
        let config: ClusterConfigResponse = self.get("/platform/1/cluster/config", &[])?;
        let release = &config.version.release;
        debug!("cluster {} reports release {}", self.base_url, release);
        if release.starts_with("v7.") {
            Ok(7.2)
        } else {
            Ok(8.0)
        }
    }

    /// The cluster's configured name. Callers fall back to the address when
    /// the identity endpoint is unavailable.
    pub fn cluster_name(&self) -> Result<String, ClientError> {
        let identity: IdentityResponse = self.get("/platform/1/cluster/identity", &[])?;
        Ok(identity.name)
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ClientError::Api(format!(
                "{} returned {}: {}",
                path,
                status,
                body.trim()
            )));
        }
        response
            .json()
            .map_err(|e| ClientError::Api(format!("bad response from {}: {}", path, e)))
    }
}

impl StatsApi for RestStatsApi {
    fn get_statistics_current(
        &self,
        keys: &str,
        devid: &str,
        timeout_secs: u64,
        degraded: bool,
        expand_clientid: bool,
    ) -> Result<Vec<Stat>, ClientError> {
        let response: CurrentResponse = self.get(
            "/platform/1/statistics/current",
            &[
                ("keys", keys.to_string()),
                ("devid", devid.to_string()),
                ("timeout", timeout_secs.to_string()),
                ("degraded", degraded.to_string()),
                ("expand_clientid", expand_clientid.to_string()),
            ],
        )?;
        Ok(response.stats)
    }

    fn get_statistics_keys(&self, resume: Option<&str>) -> Result<KeysPage, ClientError> {
        let mut query = Vec::new();
        if let Some(token) = resume {
            query.push(("resume", token.to_string()));
        }
        let response: KeysResponse = self.get("/platform/1/statistics/keys", &query)?;
        Ok(KeysPage {
            keys: response.keys,
            resume: response.resume,
        })
    }

    fn get_statistics_key(&self, key: &str) -> Result<StatMetadata, ClientError> {
        let path = format!("/platform/1/statistics/keys/{}", key);
        let response: KeysResponse = self.get(&path, &[])?;
        response
            .keys
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Api(format!("no metadata returned for stat '{}'", key)))
    }
}
