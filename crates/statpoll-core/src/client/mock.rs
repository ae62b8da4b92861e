//! Programmable in-memory transport for tests.
//!
//! `MockStatsApi` answers statistics queries from a table of canned stats
//! and metadata, records every query it receives, and can be told to fail
//! the next request. Share it behind an `Arc` to keep a handle for
//! assertions after handing it to a [`StatsClient`](super::StatsClient).

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{ClientError, KeysPage, StatsApi};
use crate::stats::{Stat, StatMetadata};

/// Keys per page returned by the metadata dump. Small so tests exercise the
/// resume protocol without thousands of entries.
const KEYS_PAGE_SIZE: usize = 100;

#[derive(Default)]
pub struct MockStatsApi {
    stats: Mutex<HashMap<String, Vec<Stat>>>,
    metadata: Mutex<Vec<StatMetadata>>,
    queries: Mutex<Vec<String>>,
    key_pages: Mutex<usize>,
    fail_next: Mutex<Option<ClientError>>,
}

impl MockStatsApi {
    pub fn new() -> Self {
        MockStatsApi::default()
    }

    /// Adds one canned sample for its key. Repeated calls accumulate, so a
    /// key can yield one stat per node.
    pub fn insert_stat(&self, stat: Stat) {
        self.stats.lock().entry(stat.key.clone()).or_default().push(stat);
    }

    /// Replaces all canned samples for `key`.
    pub fn set_stats(&self, key: &str, stats: Vec<Stat>) {
        self.stats.lock().insert(key.to_string(), stats);
    }

    pub fn insert_metadata(&self, metadata: StatMetadata) {
        self.metadata.lock().push(metadata);
    }

    /// Makes the next `get_statistics_current` call return `error`.
    pub fn fail_next_query(&self, error: ClientError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Every `keys` string received by `get_statistics_current`, in call
    /// order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    /// Number of metadata dump pages served so far.
    pub fn key_pages_fetched(&self) -> usize {
        *self.key_pages.lock()
    }
}

impl StatsApi for MockStatsApi {
    fn get_statistics_current(
        &self,
        keys: &str,
        _devid: &str,
        _timeout_secs: u64,
        _degraded: bool,
        _expand_clientid: bool,
    ) -> Result<Vec<Stat>, ClientError> {
        self.queries.lock().push(keys.to_string());
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let stats = self.stats.lock();
        let mut results = Vec::new();
        for key in keys.split(',') {
            match stats.get(key) {
                Some(samples) => results.extend(samples.iter().cloned()),
                None => results.push(Stat::with_error(key, 0, "key not found")),
            }
        }
        Ok(results)
    }

    fn get_statistics_keys(&self, resume: Option<&str>) -> Result<KeysPage, ClientError> {
        *self.key_pages.lock() += 1;
        let start = match resume {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ClientError::Api(format!("bad resume token '{}'", token)))?,
            None => 0,
        };
        let metadata = self.metadata.lock();
        let end = (start + KEYS_PAGE_SIZE).min(metadata.len());
        let keys = metadata[start..end].to_vec();
        let resume = (end < metadata.len()).then(|| end.to_string());
        Ok(KeysPage { keys, resume })
    }

    fn get_statistics_key(&self, key: &str) -> Result<StatMetadata, ClientError> {
        self.metadata
            .lock()
            .iter()
            .find(|m| m.key == key)
            .cloned()
            .ok_or_else(|| ClientError::Api(format!("unknown statistics key '{}'", key)))
    }
}
