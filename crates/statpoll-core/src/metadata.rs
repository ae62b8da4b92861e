//! Metadata-driven update-interval resolution.
//!
//! Poll cadences are supposed to track how often the cluster actually
//! refreshes each stat, which differs per stat and per cluster. Given a set
//! of clusters and stat names, the resolver fetches the stats' cache-time
//! metadata and buckets every (cluster, stat) pair under its effective
//! refresh interval.

use std::collections::BTreeMap;

use tracing::debug;

use crate::client::ClientError;
use crate::daemon::ClusterConfig;

/// The clusters and stats to poll at one interval.
#[derive(Default)]
pub struct IntervalBucket {
    /// Insertion-ordered, deduplicated.
    pub clusters: Vec<ClusterConfig>,
    pub stats: std::collections::BTreeSet<String>,
}

/// Buckets every (cluster, stat) pair by effective cache time, in seconds,
/// scaled by `multiplier`.
///
/// Each pair lands in exactly one bucket. A metadata fetch failure on any
/// cluster is fatal: the caller is configuring the daemon and must not start
/// with a partial schedule.
pub fn resolve_update_intervals(
    multiplier: u64,
    clusters: &[ClusterConfig],
    stat_names: &[String],
) -> Result<BTreeMap<u64, IntervalBucket>, ClientError> {
    let mut buckets: BTreeMap<u64, IntervalBucket> = BTreeMap::new();
    for cluster in clusters {
        let metadata = cluster.client.get_stats_metadata(stat_names)?;
        for (stat_metadata, stat_name) in metadata.iter().zip(stat_names) {
            let cache_time = stat_metadata.effective_cache_time(multiplier);
            debug!(
                "stat {} on {} refreshes every {}s",
                stat_name, cluster.name, cache_time
            );
            let bucket = buckets.entry(cache_time).or_default();
            if !bucket.clusters.contains(cluster) {
                bucket.clusters.push(cluster.clone());
            }
            bucket.stats.insert(stat_name.clone());
        }
    }
    Ok(buckets)
}
