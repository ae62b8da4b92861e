//! The collector daemon: scheduling and query fan-out.
//!
//! The daemon owns a set of update intervals, each with the per-cluster work
//! registered for it. The run loop sleeps until the soonest interval is due,
//! then services every due interval in one tick: work for the same cluster
//! across due intervals merges into a single query, queries run concurrently
//! on a bounded worker pool, and each result set drives a
//! [`DerivedStatsPipeline`] into the configured stats processor.
//!
//! Failure of one cluster never affects another; a failed cluster is simply
//! skipped until the next tick.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::client::{ClientError, StatsClient};
use crate::derived::{
    CompositeSpec, DerivedStatsPipeline, EquationSpec, PctChangeSpec, SharedPrevValues,
    new_prev_values,
};
use crate::processor::{ProcessorAdapter, ProcessorError};
use crate::stats::Stat;

/// Upper bound on concurrent cluster queries per tick.
pub const MAX_ASYNC_QUERIES: usize = 20;

/// Granularity of the run loop's sleep, so a shutdown signal is noticed
/// promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Stable identity of one cluster plus its statistics client.
///
/// Equality and hashing are on the address alone so duplicate entries
/// collapse regardless of how the cluster was named.
#[derive(Clone)]
pub struct ClusterConfig {
    pub address: String,
    pub name: String,
    /// Statistics protocol generation: 7.2 or 8.0 and newer.
    pub version: f64,
    pub client: Arc<StatsClient>,
}

impl PartialEq for ClusterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for ClusterConfig {}

impl std::hash::Hash for ClusterConfig {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Display for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A user-provided request to poll: which clusters, which stats, how often,
/// and which derived stats to compute from the results. Consumed once by
/// [`Daemon::add_stats`].
pub struct StatsConfig {
    pub cluster_configs: Vec<ClusterConfig>,
    pub stats: BTreeSet<String>,
    pub update_interval: Duration,
    pub composite_stats: Vec<CompositeSpec>,
    pub equation_stats: Vec<EquationSpec>,
    pub pct_change_stats: Vec<PctChangeSpec>,
    pub final_equation_stats: Vec<EquationSpec>,
}

impl StatsConfig {
    pub fn new(
        cluster_configs: Vec<ClusterConfig>,
        stats: impl IntoIterator<Item = String>,
        update_interval: Duration,
    ) -> Self {
        StatsConfig {
            cluster_configs,
            stats: stats.into_iter().collect(),
            update_interval,
            composite_stats: Vec::new(),
            equation_stats: Vec::new(),
            pct_change_stats: Vec::new(),
            final_equation_stats: Vec::new(),
        }
    }
}

/// The work registered for one cluster at one update interval: the union of
/// stat names plus the concatenated derived-stat specs of every
/// [`StatsConfig`] that named this cluster.
#[derive(Default, Clone)]
pub struct ClusterStatSet {
    pub stats: BTreeSet<String>,
    pub composite_stats: Vec<CompositeSpec>,
    pub equation_stats: Vec<EquationSpec>,
    pub pct_change_stats: Vec<PctChangeSpec>,
    pub final_equation_stats: Vec<EquationSpec>,
}

impl ClusterStatSet {
    fn merge(&mut self, other: &ClusterStatSet) {
        self.stats.extend(other.stats.iter().cloned());
        self.composite_stats.extend(other.composite_stats.iter().cloned());
        self.equation_stats.extend(other.equation_stats.iter().cloned());
        self.pct_change_stats.extend(other.pct_change_stats.iter().cloned());
        self.final_equation_stats
            .extend(other.final_equation_stats.iter().cloned());
    }

    fn has_derived_stats(&self) -> bool {
        !self.composite_stats.is_empty()
            || !self.equation_stats.is_empty()
            || !self.pct_change_stats.is_empty()
            || !self.final_equation_stats.is_empty()
    }
}

/// The merged work for one update interval, scoped per cluster: a
/// `StatsConfig` contributing to an existing interval never causes its stats
/// to be queried on clusters it did not name.
#[derive(Default)]
pub struct StatSet {
    entries: Vec<(ClusterConfig, ClusterStatSet)>,
}

impl StatSet {
    fn entry_mut(&mut self, cluster: &ClusterConfig) -> &mut ClusterStatSet {
        let index = match self.entries.iter().position(|(c, _)| c == cluster) {
            Some(index) => index,
            None => {
                self.entries.push((cluster.clone(), ClusterStatSet::default()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index].1
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ClusterConfig, ClusterStatSet)> {
        self.entries.iter()
    }
}

/// One polling cadence. `last_update` is monotonic so wall-clock steps do
/// not shift the schedule; it starts unset so the first tick fires
/// immediately.
pub struct UpdateInterval {
    pub interval: Duration,
    last_update: Option<Instant>,
}

impl UpdateInterval {
    fn new(interval: Duration) -> Self {
        UpdateInterval {
            interval,
            last_update: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_update {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    fn time_to_next(&self, now: Instant) -> Duration {
        match self.last_update {
            None => Duration::ZERO,
            Some(last) => (last + self.interval).saturating_duration_since(now),
        }
    }
}

/// One cluster's merged work for one tick.
struct ClusterJob {
    cluster: ClusterConfig,
    work: ClusterStatSet,
}

#[derive(Debug)]
pub enum DaemonError {
    /// `run` was called before `set_stats_processor`.
    NoProcessor,
    Processor(ProcessorError),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::NoProcessor => f.write_str("no stats processor configured"),
            DaemonError::Processor(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<ProcessorError> for DaemonError {
    fn from(error: ProcessorError) -> Self {
        DaemonError::Processor(error)
    }
}

/// Periodically queries a set of clusters for statistics and forwards raw
/// and derived values to a configurable stats processor.
pub struct Daemon {
    stat_sets: HashMap<Duration, StatSet>,
    update_intervals: Vec<UpdateInterval>,
    processor: Option<Arc<ProcessorAdapter>>,
    prev_values: SharedPrevValues,
    running: Arc<AtomicBool>,
}

impl Default for Daemon {
    fn default() -> Self {
        Daemon::new()
    }
}

impl Daemon {
    pub fn new() -> Self {
        Daemon {
            stat_sets: HashMap::new(),
            update_intervals: Vec::new(),
            processor: None,
            prev_values: new_prev_values(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag that stops the run loop when cleared. Hand a clone to the signal
    /// handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stops the run loop after the current tick drains. The loop stops the
    /// stats processor on its way out.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Installs the stats processor and starts it. Must run before the loop
    /// starts so a processor that prompts for input can do so while stdin is
    /// still attached.
    pub fn set_stats_processor(
        &mut self,
        processor: ProcessorAdapter,
        args: &[String],
    ) -> Result<(), ProcessorError> {
        info!("starting stats processor");
        processor.start(args)?;
        self.processor = Some(Arc::new(processor));
        Ok(())
    }

    /// Registers a set of stats to be queried. Work is organized by update
    /// interval and scoped to the clusters the config names.
    pub fn add_stats(&mut self, config: StatsConfig) {
        let stat_set = match self.stat_sets.entry(config.update_interval) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.update_intervals
                    .push(UpdateInterval::new(config.update_interval));
                entry.insert(StatSet::default())
            }
        };
        let contributed = ClusterStatSet {
            stats: config.stats,
            composite_stats: config.composite_stats,
            equation_stats: config.equation_stats,
            pct_change_stats: config.pct_change_stats,
            final_equation_stats: config.final_equation_stats,
        };
        for cluster in &config.cluster_configs {
            stat_set.entry_mut(cluster).merge(&contributed);
        }
    }

    pub fn stat_set_count(&self) -> usize {
        self.stat_sets.len()
    }

    /// The configured stat sets, for logging at startup.
    pub fn stat_sets(&self) -> impl Iterator<Item = (Duration, &StatSet)> {
        self.update_intervals
            .iter()
            .filter_map(|u| self.stat_sets.get(&u.interval).map(|s| (u.interval, s)))
    }

    fn has_derived_stats(&self) -> bool {
        self.stat_sets
            .values()
            .flat_map(|set| set.iter())
            .any(|(_, work)| work.has_derived_stats())
    }

    /// The main loop: tick, sleep until the soonest interval is due, repeat
    /// until the shutdown flag clears. Every interval fires on the first
    /// pass.
    ///
    /// With `debug` set, unexpected per-cluster errors panic instead of
    /// being skipped, surfacing bugs to the developer.
    pub fn run(&mut self, debug: bool) -> Result<(), DaemonError> {
        let processor = self.processor.clone().ok_or(DaemonError::NoProcessor)?;
        if !processor.supports_derived_stats() && self.has_derived_stats() {
            warn!(
                "the configured stats processor does not support derived stats; \
                 composite, equation, and percent change stats will not be computed"
            );
        }
        info!("starting");
        while self.running.load(Ordering::SeqCst) {
            self.tick(Instant::now(), debug);

            let now = Instant::now();
            let sleep = self
                .update_intervals
                .iter()
                .map(|u| u.time_to_next(now))
                .min()
                .unwrap_or(Duration::from_secs(1));
            debug!("sleeping for {:?}", sleep);
            let mut remaining = sleep;
            while remaining > Duration::ZERO && self.running.load(Ordering::SeqCst) {
                let slice = remaining.min(SLEEP_SLICE);
                std::thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }
        info!("stopping");
        processor.stop();
        Ok(())
    }

    /// Services every interval due at `now`. The same snapshot time is
    /// recorded for all of them before any query is dispatched, so query
    /// duration does not shift the schedule.
    pub fn tick(&mut self, now: Instant, debug: bool) {
        let jobs = self.collect_due_work(now);
        if !jobs.is_empty() {
            self.dispatch(jobs, debug);
        }
    }

    /// Merges the stat sets of every due interval into at most one job per
    /// cluster.
    fn collect_due_work(&mut self, now: Instant) -> Vec<ClusterJob> {
        let mut jobs: Vec<ClusterJob> = Vec::new();
        for update_interval in &mut self.update_intervals {
            if !update_interval.is_due(now) {
                continue;
            }
            debug!("updating interval {:?}", update_interval.interval);
            update_interval.last_update = Some(now);
            let Some(stat_set) = self.stat_sets.get(&update_interval.interval) else {
                continue;
            };
            for (cluster, work) in stat_set.iter() {
                match jobs.iter_mut().find(|job| job.cluster == *cluster) {
                    Some(job) => job.work.merge(work),
                    None => jobs.push(ClusterJob {
                        cluster: cluster.clone(),
                        work: work.clone(),
                    }),
                }
            }
        }
        jobs
    }

    /// Runs the tick's jobs on a worker pool bounded by
    /// [`MAX_ASYNC_QUERIES`] and joins them all before returning, so ticks
    /// never interleave.
    fn dispatch(&self, jobs: Vec<ClusterJob>, debug: bool) {
        let Some(processor) = &self.processor else {
            error!("no stats processor configured, dropping {} jobs", jobs.len());
            return;
        };
        let worker_count = jobs.len().min(MAX_ASYNC_QUERIES);
        let (sender, receiver) = flume::unbounded();
        for job in jobs {
            let _ = sender.send(job);
        }
        drop(sender);
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let receiver = receiver.clone();
                let processor = Arc::clone(processor);
                let prev_values = Arc::clone(&self.prev_values);
                scope.spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        run_cluster_job(&job, &processor, &prev_values, debug);
                    }
                });
            }
        });
    }
}

/// Queries one cluster and drives its results through the derived-stat
/// pipeline. Transport and API errors skip the cluster for this tick; the
/// next tick is the retry.
fn run_cluster_job(
    job: &ClusterJob,
    processor: &ProcessorAdapter,
    prev_values: &SharedPrevValues,
    debug: bool,
) {
    let cluster = &job.cluster;
    debug!(
        "querying {} stats from cluster {} (version {})",
        job.work.stats.len(),
        cluster.name,
        cluster.version
    );
    let keys: Vec<String> = job.work.stats.iter().cloned().collect();
    let query_result = if cluster.version >= 8.0 {
        cluster.client.query_stats(&keys)
    } else {
        multistat_query(&cluster.client, &keys)
    };
    let results = match query_result {
        Ok(results) => results,
        Err(error @ (ClientError::Transport(_) | ClientError::Api(_))) => {
            error!(
                "failed to query stats from cluster {}: {}",
                cluster.name, error
            );
            return;
        }
        Err(ClientError::Unexpected(message)) => {
            if debug {
                panic!(
                    "unexpected error querying cluster {}: {}",
                    cluster.name, message
                );
            }
            error!(
                "failed to query stats from cluster {}: unexpected error: {}",
                cluster.name, message
            );
            return;
        }
    };
    let mut pipeline = DerivedStatsPipeline::new(
        &job.work.composite_stats,
        &job.work.equation_stats,
        &job.work.pct_change_stats,
        &job.work.final_equation_stats,
        prev_values,
    );
    pipeline.process(&cluster.name, results, processor);
}

/// Version 7.2 clusters lack the batch endpoint: query one key at a time
/// and concatenate.
fn multistat_query(client: &StatsClient, keys: &[String]) -> Result<Vec<Stat>, ClientError> {
    let mut results = Vec::new();
    for key in keys {
        results.extend(client.query_stat(key)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::client::mock::MockStatsApi;
    use crate::processor::StreamingProcessor;
    use crate::stats::StatValue;

    #[derive(Clone, Default)]
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl StreamingProcessor for Recording {
        fn process_stat(&self, cluster_name: &str, stat: &Stat) {
            self.events
                .lock()
                .push(format!("{} {}[{}]={}", cluster_name, stat.key, stat.devid, stat.value));
        }
    }

    fn mock_cluster(name: &str, version: f64) -> (ClusterConfig, Arc<MockStatsApi>) {
        let mock = Arc::new(MockStatsApi::new());
        let cluster = ClusterConfig {
            address: format!("{}.example.com", name),
            name: name.to_string(),
            version,
            client: Arc::new(StatsClient::new(Box::new(Arc::clone(&mock)))),
        };
        (cluster, mock)
    }

    fn daemon_with_recorder() -> (Daemon, Recording) {
        let mut daemon = Daemon::new();
        let recording = Recording::default();
        daemon
            .set_stats_processor(
                ProcessorAdapter::Streaming(Box::new(recording.clone())),
                &[],
            )
            .unwrap();
        (daemon, recording)
    }

    #[test]
    fn single_cluster_single_stat_queries_on_schedule() {
        let (mut daemon, recording) = daemon_with_recorder();
        let (cluster, mock) = mock_cluster("alpha", 8.0);
        mock.insert_stat(Stat::new("node.cpu.idle", 1, 100, StatValue::Int(90)));
        daemon.add_stats(StatsConfig::new(
            vec![cluster],
            ["node.cpu.idle".to_string()],
            Duration::from_secs(30),
        ));

        let base = Instant::now();
        daemon.tick(base, false);
        assert_eq!(mock.queries(), vec!["node.cpu.idle"]);
        assert_eq!(recording.events(), vec!["alpha node.cpu.idle[1]=90"]);

        // not due yet
        daemon.tick(base + Duration::from_secs(29), false);
        assert_eq!(mock.queries().len(), 1);

        // second interval
        daemon.tick(base + Duration::from_secs(30), false);
        assert_eq!(mock.queries().len(), 2);
    }

    #[test]
    fn intervals_sharing_a_cluster_merge_into_one_query() {
        let (mut daemon, _recording) = daemon_with_recorder();
        let (cluster, mock) = mock_cluster("alpha", 8.0);
        mock.insert_stat(Stat::new("node.stat.a", 1, 100, StatValue::Int(1)));
        mock.insert_stat(Stat::new("node.stat.b", 1, 100, StatValue::Int(2)));
        daemon.add_stats(StatsConfig::new(
            vec![cluster.clone()],
            ["node.stat.a".to_string()],
            Duration::from_secs(10),
        ));
        daemon.add_stats(StatsConfig::new(
            vec![cluster],
            ["node.stat.b".to_string()],
            Duration::from_secs(30),
        ));

        let base = Instant::now();
        // both intervals due on the first pass: exactly one query with the
        // union of both stat sets
        daemon.tick(base, false);
        assert_eq!(mock.queries(), vec!["node.stat.a,node.stat.b"]);

        // only the 10s interval is due
        daemon.tick(base + Duration::from_secs(10), false);
        assert_eq!(mock.queries()[1], "node.stat.a");

        // at t=30 both are due again: still one query
        daemon.tick(base + Duration::from_secs(30), false);
        assert_eq!(mock.queries()[2], "node.stat.a,node.stat.b");
        assert_eq!(mock.queries().len(), 3);
    }

    #[test]
    fn stats_stay_scoped_to_their_own_clusters() {
        let (mut daemon, _recording) = daemon_with_recorder();
        let (alpha, alpha_mock) = mock_cluster("alpha", 8.0);
        let (beta, beta_mock) = mock_cluster("beta", 8.0);
        alpha_mock.insert_stat(Stat::new("node.stat.a", 1, 100, StatValue::Int(1)));
        beta_mock.insert_stat(Stat::new("node.stat.b", 1, 100, StatValue::Int(2)));
        // same interval, different clusters
        daemon.add_stats(StatsConfig::new(
            vec![alpha],
            ["node.stat.a".to_string()],
            Duration::from_secs(30),
        ));
        daemon.add_stats(StatsConfig::new(
            vec![beta],
            ["node.stat.b".to_string()],
            Duration::from_secs(30),
        ));

        daemon.tick(Instant::now(), false);
        // each cluster is queried only for its own stats
        assert_eq!(alpha_mock.queries(), vec!["node.stat.a"]);
        assert_eq!(beta_mock.queries(), vec!["node.stat.b"]);
    }

    #[test]
    fn version_7_clusters_query_one_key_per_call() {
        let (mut daemon, _recording) = daemon_with_recorder();
        let (cluster, mock) = mock_cluster("legacy", 7.2);
        mock.insert_stat(Stat::new("node.stat.a", 1, 100, StatValue::Int(1)));
        mock.insert_stat(Stat::new("node.stat.b", 1, 100, StatValue::Int(2)));
        daemon.add_stats(StatsConfig::new(
            vec![cluster],
            ["node.stat.a".to_string(), "node.stat.b".to_string()],
            Duration::from_secs(30),
        ));

        daemon.tick(Instant::now(), false);
        assert_eq!(mock.queries(), vec!["node.stat.a", "node.stat.b"]);
    }

    #[test]
    fn one_cluster_failing_does_not_affect_another() {
        let (mut daemon, recording) = daemon_with_recorder();
        let (alpha, alpha_mock) = mock_cluster("alpha", 8.0);
        let (beta, beta_mock) = mock_cluster("beta", 8.0);
        alpha_mock.fail_next_query(ClientError::Transport("connection refused".into()));
        beta_mock.insert_stat(Stat::new("node.cpu.idle", 1, 100, StatValue::Int(42)));
        daemon.add_stats(StatsConfig::new(
            vec![alpha, beta],
            ["node.cpu.idle".to_string()],
            Duration::from_secs(30),
        ));

        daemon.tick(Instant::now(), false);
        assert_eq!(recording.events(), vec!["beta node.cpu.idle[1]=42"]);
    }

    #[test]
    fn adding_the_same_config_twice_is_idempotent_on_stats() {
        let (mut daemon, _recording) = daemon_with_recorder();
        let (cluster, mock) = mock_cluster("alpha", 8.0);
        mock.insert_stat(Stat::new("node.stat.a", 1, 100, StatValue::Int(1)));
        for _ in 0..2 {
            daemon.add_stats(StatsConfig::new(
                vec![cluster.clone()],
                ["node.stat.a".to_string()],
                Duration::from_secs(30),
            ));
        }
        assert_eq!(daemon.stat_set_count(), 1);
        daemon.tick(Instant::now(), false);
        assert_eq!(mock.queries(), vec!["node.stat.a"]);
    }

    #[test]
    fn percent_change_state_survives_across_ticks() {
        let (mut daemon, recording) = daemon_with_recorder();
        let (cluster, mock) = mock_cluster("alpha", 8.0);
        mock.insert_stat(Stat::new("node.ifs.bytes.used", 1, 0, StatValue::Int(100)));
        let mut config = StatsConfig::new(
            vec![cluster],
            ["node.ifs.bytes.used".to_string()],
            Duration::from_secs(30),
        );
        config.pct_change_stats.push(PctChangeSpec::new(
            crate::derived::DerivedStatInput::new("node.ifs.bytes.used", None),
            "node.ifs.bytes.used.percentchange",
        ));
        daemon.add_stats(config);

        let base = Instant::now();
        daemon.tick(base, false);
        mock.set_stats(
            "node.ifs.bytes.used",
            vec![Stat::new("node.ifs.bytes.used", 1, 30, StatValue::Int(150))],
        );
        daemon.tick(base + Duration::from_secs(30), false);

        let events = recording.events();
        assert!(events.contains(&"alpha node.ifs.bytes.used.percentchange[1]=0.0".to_string()));
        assert!(events.contains(&"alpha node.ifs.bytes.used.percentchange[1]=50.0".to_string()));
    }

    #[test]
    fn update_interval_schedule() {
        let base = Instant::now();
        let mut interval = UpdateInterval::new(Duration::from_secs(10));
        assert!(interval.is_due(base));
        assert_eq!(interval.time_to_next(base), Duration::ZERO);

        interval.last_update = Some(base);
        assert!(!interval.is_due(base + Duration::from_secs(9)));
        assert!(interval.is_due(base + Duration::from_secs(10)));
        assert_eq!(
            interval.time_to_next(base + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
    }
}
