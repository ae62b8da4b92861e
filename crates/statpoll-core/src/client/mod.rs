//! Cluster statistics client.
//!
//! [`StatsClient`] handles the details of querying a cluster for statistics
//! values and key metadata. The wire protocol lives behind the [`StatsApi`]
//! trait so that the scheduler can run against the real REST transport
//! ([`RestStatsApi`]) or a programmable mock ([`mock::MockStatsApi`]) in
//! tests.

pub mod mock;
mod rest;

use std::collections::HashMap;

pub use rest::RestStatsApi;

use crate::stats::{Stat, StatMetadata};

/// The cluster API has a request URI limit of 8096 bytes; `MAX_KEYS_LEN` is
/// the longest comma-joined key string the client will send in one query.
pub const MAX_KEYS_LEN: usize = 7000;

/// When fetching metadata for fewer than this many stats, issue one direct
/// key query per stat; at or above it, page through the full key dump and
/// filter client-side. The cutoff minimizes round-trip time vs. response
/// size on the target cluster API.
pub const MAX_DIRECT_METADATA_STATS: usize = 200;

/// Seconds to wait for results from remote nodes, carried on every query.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 60;

/// Error type for cluster statistics queries.
#[derive(Debug)]
pub enum ClientError {
    /// The HTTP request could not be completed.
    Transport(String),
    /// The cluster answered with an API-level error.
    Api(String),
    /// Anything else; most likely a bug rather than a cluster problem.
    Unexpected(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(msg) => write!(f, "transport error: {}", msg),
            ClientError::Api(msg) => write!(f, "API error: {}", msg),
            ClientError::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// One page of the cluster's key metadata dump.
#[derive(Debug, Clone)]
pub struct KeysPage {
    pub keys: Vec<StatMetadata>,
    /// Token for the next page, `None` on the last one.
    pub resume: Option<String>,
}

/// Low-level statistics endpoints of one cluster.
pub trait StatsApi: Send + Sync {
    /// Current values for a comma-joined key string.
    fn get_statistics_current(
        &self,
        keys: &str,
        devid: &str,
        timeout_secs: u64,
        degraded: bool,
        expand_clientid: bool,
    ) -> Result<Vec<Stat>, ClientError>;

    /// One page of the full key metadata dump.
    fn get_statistics_keys(&self, resume: Option<&str>) -> Result<KeysPage, ClientError>;

    /// Metadata for a single key.
    fn get_statistics_key(&self, key: &str) -> Result<StatMetadata, ClientError>;
}

impl<T: StatsApi + ?Sized> StatsApi for std::sync::Arc<T> {
    fn get_statistics_current(
        &self,
        keys: &str,
        devid: &str,
        timeout_secs: u64,
        degraded: bool,
        expand_clientid: bool,
    ) -> Result<Vec<Stat>, ClientError> {
        (**self).get_statistics_current(keys, devid, timeout_secs, degraded, expand_clientid)
    }

    fn get_statistics_keys(&self, resume: Option<&str>) -> Result<KeysPage, ClientError> {
        (**self).get_statistics_keys(resume)
    }

    fn get_statistics_key(&self, key: &str) -> Result<StatMetadata, ClientError> {
        (**self).get_statistics_key(key)
    }
}

/// Handles the details of querying one cluster for statistics values and
/// metadata over a [`StatsApi`] transport.
pub struct StatsClient {
    api: Box<dyn StatsApi>,
}

impl StatsClient {
    pub fn new(api: Box<dyn StatsApi>) -> Self {
        StatsClient { api }
    }

    /// Queries the cluster for a list of stat values in as few requests as
    /// the URI length limit allows. Works on version 8.0 or newer clusters.
    ///
    /// Keys are comma-joined; a joined string longer than [`MAX_KEYS_LEN`]
    /// is split on comma boundaries into multiple requests and the results
    /// concatenated.
    pub fn query_stats(&self, stats: &[String]) -> Result<Vec<Stat>, ClientError> {
        let joined = stats.join(",");
        let total_len = joined.len();
        let mut results = Vec::new();
        let mut start = 0;
        while start < total_len {
            let end = if total_len - start > MAX_KEYS_LEN {
                // split at the last comma that keeps the chunk under the limit
                match joined[start..start + MAX_KEYS_LEN].rfind(',') {
                    Some(pos) => start + pos,
                    None => {
                        return Err(ClientError::Api(format!(
                            "stat key exceeds the {} character query limit",
                            MAX_KEYS_LEN
                        )));
                    }
                }
            } else {
                total_len
            };
            results.extend(self.api.get_statistics_current(
                &joined[start..end],
                "all",
                DEFAULT_QUERY_TIMEOUT_SECS,
                true,
                false,
            )?);
            start = if end == total_len { total_len } else { end + 1 };
        }
        Ok(results)
    }

    /// Queries the cluster for a single stat's values. This is the fallback
    /// path for version 7.2 clusters, which lack the batch endpoint.
    pub fn query_stat(&self, stat: &str) -> Result<Vec<Stat>, ClientError> {
        self.api
            .get_statistics_current(stat, "all", DEFAULT_QUERY_TIMEOUT_SECS, true, false)
    }

    /// Metadata for each key in `stats`, in input order. A key the cluster
    /// reports no metadata for is an API error.
    pub fn get_stats_metadata(&self, stats: &[String]) -> Result<Vec<StatMetadata>, ClientError> {
        if stats.len() < MAX_DIRECT_METADATA_STATS {
            self.get_metadata_direct(stats)
        } else {
            self.get_metadata_paged(stats)
        }
    }

    fn get_metadata_direct(&self, stats: &[String]) -> Result<Vec<StatMetadata>, ClientError> {
        stats
            .iter()
            .map(|stat| self.api.get_statistics_key(stat))
            .collect()
    }

    /// Pages through the full key dump and filters it down to the requested
    /// keys client-side.
    fn get_metadata_paged(&self, stats: &[String]) -> Result<Vec<StatMetadata>, ClientError> {
        let positions: HashMap<&str, usize> = stats
            .iter()
            .enumerate()
            .map(|(index, name)| (name.as_str(), index))
            .collect();
        let mut found: Vec<Option<StatMetadata>> = vec![None; stats.len()];
        let mut remaining = stats.len();
        let mut resume: Option<String> = None;
        loop {
            let page = self.api.get_statistics_keys(resume.as_deref())?;
            for metadata in page.keys {
                if let Some(&index) = positions.get(metadata.key.as_str()) {
                    if found[index].is_none() {
                        found[index] = Some(metadata);
                        remaining -= 1;
                        if remaining == 0 {
                            break;
                        }
                    }
                }
            }
            if remaining == 0 {
                break;
            }
            match page.resume {
                Some(token) => resume = Some(token),
                None => break,
            }
        }
        found
            .into_iter()
            .zip(stats)
            .map(|(metadata, name)| {
                metadata.ok_or_else(|| {
                    ClientError::Api(format!("no metadata returned for stat '{}'", name))
                })
            })
            .collect()
    }
}
