//! TOML configuration for the collector daemon.
//!
//! The file carries a `[daemon]` table (processor selection, global cluster
//! list, active stat groups) and one `[group.<name>]` table per stat group.
//! A stat group names the stats to poll, how often, and the derived stats to
//! compute from them. Groups are turned into validated
//! [`StatsConfig`] values and registered with the daemon; any problem here
//! is fatal before the run loop starts.
//!
//! Cluster entries use `[username:password@]address[:verify_ssl]` syntax.
//! Credentials missing from an entry fall back to the `[daemon]` table's
//! `default_username`/`default_password`.
//!
//! `update_interval` is either a number of seconds or a `"*N"` string, which
//! resolves per-stat intervals from cluster cache-time metadata, scaled by
//! the multiplier N.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use statpoll_core::client::{ClientError, RestStatsApi, StatsClient};
use statpoll_core::daemon::{ClusterConfig, Daemon, StatsConfig};
use statpoll_core::derived::{
    CompositeOp, CompositeSpec, DerivedStatInput, EquationSpec, PctChangeSpec, expr,
};
use statpoll_core::metadata::resolve_update_intervals;
use statpoll_core::processor::ProcessorError;
use tracing::{info, warn};

use crate::sinks;

/// Floor on polling cadence, so a misconfigured group cannot overload a
/// cluster with stat queries. Overridable via `min_update_interval_override`.
pub const MIN_UPDATE_INTERVAL: u64 = 30;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
    Client(ClientError),
    Processor(ProcessorError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "{}", msg),
            ConfigError::Parse(msg) => write!(f, "{}", msg),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
            ConfigError::Client(e) => write!(f, "{}", e),
            ConfigError::Processor(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ClientError> for ConfigError {
    fn from(error: ClientError) -> Self {
        ConfigError::Client(error)
    }
}

impl From<ProcessorError> for ConfigError {
    fn from(error: ProcessorError) -> Self {
        ConfigError::Processor(error)
    }
}

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub daemon: DaemonSection,
    #[serde(default)]
    pub group: BTreeMap<String, GroupSection>,
}

#[derive(Debug, Deserialize)]
pub struct DaemonSection {
    pub processor: Option<String>,
    #[serde(default)]
    pub processor_args: Vec<String>,
    /// Clusters every stat group polls, in addition to its own.
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub active_stat_groups: Vec<String>,
    pub min_update_interval_override: Option<u64>,
    pub default_username: Option<String>,
    pub default_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupSection {
    #[serde(default)]
    pub clusters: Vec<String>,
    pub stats: Vec<String>,
    pub update_interval: UpdateIntervalParam,
    /// `op(stat[:field...])` strings, op one of avg/min/max/sum.
    #[serde(default)]
    pub composite_stats: Vec<String>,
    /// Output stat name to arithmetic expression over input stat names.
    #[serde(default)]
    pub equation_stats: BTreeMap<String, String>,
    #[serde(default)]
    pub percent_change_stats: Vec<String>,
    #[serde(default)]
    pub final_equation_stats: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UpdateIntervalParam {
    Seconds(u64),
    /// `"*"` or `"*N"`: resolve from metadata with multiplier N.
    Resolve(String),
}

pub fn load_file(path: &str) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {}", path, e)))?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse(format!("failed to parse {}: {}", path, e)))
}

/// Configures the daemon's stats processor and stat groups from the file.
/// CLI values override their file counterparts.
pub fn configure(
    daemon: &mut Daemon,
    file: &FileConfig,
    processor_override: Option<&str>,
    processor_args_override: Option<&str>,
) -> Result<(), ConfigError> {
    let processor_name = processor_override
        .map(str::to_string)
        .or_else(|| file.daemon.processor.clone())
        .ok_or_else(|| ConfigError::Invalid("no stats processor configured".into()))?;
    let processor_args: Vec<String> = match processor_args_override {
        Some(args) => args.split_whitespace().map(str::to_string).collect(),
        None => file.daemon.processor_args.clone(),
    };
    let processor = sinks::create(&processor_name).ok_or_else(|| {
        ConfigError::Invalid(format!("unknown stats processor '{}'", processor_name))
    })?;
    daemon.set_stats_processor(processor, &processor_args)?;

    let min_update_interval = match file.daemon.min_update_interval_override {
        Some(value) => {
            warn!(
                "overriding minimum update interval of {}s with {}s",
                MIN_UPDATE_INTERVAL, value
            );
            value
        }
        None => MIN_UPDATE_INTERVAL,
    };

    let global_entries: Vec<ClusterEntry> = file
        .daemon
        .clusters
        .iter()
        .map(|entry| parse_cluster_entry(entry))
        .collect::<Result<_, _>>()?;

    let mut cluster_cache = HashMap::new();
    for group_name in &file.daemon.active_stat_groups {
        let group = file.group.get(group_name).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "active stat group '{}' has no [group.{}] section",
                group_name, group_name
            ))
        })?;
        configure_stat_group(
            daemon,
            group_name,
            group,
            &global_entries,
            &file.daemon,
            &mut cluster_cache,
            min_update_interval,
        )?;
    }

    if daemon.stat_set_count() == 0 {
        return Err(ConfigError::Invalid(
            "no stat groups to query; list them in active_stat_groups".into(),
        ));
    }
    Ok(())
}

/// One cluster endpoint from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEntry {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_ssl: Option<bool>,
}

/// Parses `[username:password@]address[:verify_ssl]`.
pub fn parse_cluster_entry(text: &str) -> Result<ClusterEntry, ConfigError> {
    let (credentials, rest) = match text.rsplit_once('@') {
        Some((credentials, rest)) => (Some(credentials), rest),
        None => (None, text),
    };
    let (username, password) = match credentials {
        Some(credentials) => {
            let (username, password) = credentials.split_once(':').ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "invalid cluster entry '{}' (expected <username>:<password> prefix)",
                    text
                ))
            })?;
            (Some(username.to_string()), Some(password.to_string()))
        }
        None => (None, None),
    };
    let (address, verify_ssl) = match rest.split_once(':') {
        Some((address, flag)) => {
            let verify_ssl = match flag.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "invalid cluster entry '{}' (expected true or false after '{}')",
                        text, address
                    )));
                }
            };
            (address, Some(verify_ssl))
        }
        None => (rest, None),
    };
    if address.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "invalid cluster entry '{}' (empty address)",
            text
        )));
    }
    Ok(ClusterEntry {
        address: address.to_string(),
        username,
        password,
        // credentials in the entry imply a self-signed setup
        verify_ssl,
    })
}

/// Connects to one cluster: detects the statistics protocol version and the
/// cluster's name. Cached per address so shared clusters are probed once.
fn build_cluster_config(
    entry: &ClusterEntry,
    daemon_cfg: &DaemonSection,
    cache: &mut HashMap<String, ClusterConfig>,
) -> Result<ClusterConfig, ConfigError> {
    if let Some(existing) = cache.get(&entry.address) {
        return Ok(existing.clone());
    }
    let username = entry
        .username
        .clone()
        .or_else(|| daemon_cfg.default_username.clone())
        .ok_or_else(|| {
            ConfigError::Invalid(format!("no username configured for cluster {}", entry.address))
        })?;
    let password = entry
        .password
        .clone()
        .or_else(|| daemon_cfg.default_password.clone())
        .ok_or_else(|| {
            ConfigError::Invalid(format!("no password configured for cluster {}", entry.address))
        })?;
    let verify_ssl = entry.verify_ssl.unwrap_or(false);

    let api = RestStatsApi::new(&entry.address, &username, &password, verify_ssl)?;
    let version = api.detect_version()?;
    // the identity endpoint is optional; fall back to the address
    let name = api.cluster_name().unwrap_or_else(|_| entry.address.clone());
    info!("configured {} as version {} cluster", entry.address, version);

    let config = ClusterConfig {
        address: entry.address.clone(),
        name,
        version,
        client: Arc::new(StatsClient::new(Box::new(api))),
    };
    cache.insert(entry.address.clone(), config.clone());
    Ok(config)
}

/// The parsed derived-stat specs of one group.
#[derive(Default)]
pub struct GroupSpecs {
    pub composites: Vec<CompositeSpec>,
    pub equations: Vec<EquationSpec>,
    pub pct_changes: Vec<PctChangeSpec>,
    pub final_equations: Vec<EquationSpec>,
}

impl GroupSpecs {
    fn is_empty(&self) -> bool {
        self.composites.is_empty()
            && self.equations.is_empty()
            && self.pct_changes.is_empty()
            && self.final_equations.is_empty()
    }
}

pub fn build_group_specs(group_name: &str, group: &GroupSection) -> Result<GroupSpecs, ConfigError> {
    Ok(GroupSpecs {
        composites: parse_composite_stats(group_name, &group.composite_stats)?,
        equations: build_equation_specs(group_name, &group.equation_stats)?,
        pct_changes: parse_pct_change_stats(&group.percent_change_stats),
        final_equations: build_equation_specs(group_name, &group.final_equation_stats)?,
    })
}

/// Parses `op(stat[:field...])` composite definitions. The output name is
/// `cluster.<input>.<op>` with field separators turned into dots.
fn parse_composite_stats(
    group_name: &str,
    entries: &[String],
) -> Result<Vec<CompositeSpec>, ConfigError> {
    let mut composites = Vec::new();
    for stat_cfg in entries {
        let (open, close) = match (stat_cfg.find('('), stat_cfg.rfind(')')) {
            (Some(open), Some(close)) if open > 0 && open < close => (open, close),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "failed to parse composite stat '{}' in group '{}': expected op(stat) \
                     where op is avg, min, max, or sum",
                    stat_cfg, group_name
                )));
            }
        };
        let op_name = &stat_cfg[..open];
        let op = CompositeOp::parse(op_name).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "invalid operation '{}' in composite stat '{}' in group '{}'",
                op_name, stat_cfg, group_name
            ))
        })?;
        let in_stat_name = &stat_cfg[open + 1..close];
        if !in_stat_name.starts_with("node.") {
            return Err(ConfigError::Invalid(format!(
                "invalid stat name '{}' in composite stat '{}' in group '{}': \
                 composite stats must start with \"node.\"",
                in_stat_name, stat_cfg, group_name
            )));
        }
        let out_stat_name = format!("cluster.{}.{}", in_stat_name.replace(':', "."), op.name());
        composites.push(CompositeSpec {
            input: DerivedStatInput::parse(in_stat_name),
            out_name: out_stat_name,
            op,
        });
    }
    Ok(composites)
}

/// Compiles equation definitions. The expression's operand names become the
/// equation's inputs, one per occurrence, in expression order.
fn build_equation_specs(
    group_name: &str,
    entries: &BTreeMap<String, String>,
) -> Result<Vec<EquationSpec>, ConfigError> {
    let mut equations = Vec::new();
    for (out_name, expression) in entries {
        let (parsed, names) = expr::parse(expression).map_err(|e| {
            ConfigError::Invalid(format!(
                "failed to parse expression for '{}' in group '{}': {}",
                out_name, group_name, e
            ))
        })?;
        let inputs = names.iter().map(|name| DerivedStatInput::parse(name)).collect();
        equations.push(EquationSpec::new(out_name.clone(), parsed, inputs));
    }
    Ok(equations)
}

/// Percent-change stats are a plain list of input names; the output name
/// appends `.percentchange`.
fn parse_pct_change_stats(entries: &[String]) -> Vec<PctChangeSpec> {
    entries
        .iter()
        .map(|stat_name| {
            let out_stat_name = format!("{}.percentchange", stat_name.replace(':', "."));
            PctChangeSpec::new(DerivedStatInput::parse(stat_name), out_stat_name)
        })
        .collect()
}

/// Every derived-stat input must be one of the group's polled stats or the
/// output of an upstream tier, so unknown stat names are rejected before the
/// daemon starts.
pub fn validate_derived_inputs(
    group_name: &str,
    stats: &BTreeSet<String>,
    specs: &GroupSpecs,
) -> Result<(), ConfigError> {
    let mut known: BTreeSet<&str> = stats.iter().map(String::as_str).collect();

    let check = |known: &BTreeSet<&str>, input: &DerivedStatInput, kind: &str, out: &str| {
        if known.contains(input.name.as_str()) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "unknown input stat '{}' for {} '{}' in group '{}'",
                input.name, kind, out, group_name
            )))
        }
    };

    for spec in &specs.composites {
        check(&known, &spec.input, "composite stat", &spec.out_name)?;
    }
    known.extend(specs.composites.iter().map(|s| s.out_name.as_str()));

    for spec in &specs.equations {
        for input in spec.inputs() {
            check(&known, input, "equation stat", &spec.out_name)?;
        }
    }
    known.extend(specs.equations.iter().map(|s| s.out_name.as_str()));

    for spec in &specs.pct_changes {
        check(&known, &spec.input, "percent change stat", &spec.out_name)?;
    }
    known.extend(specs.pct_changes.iter().map(|s| s.out_name.as_str()));

    for spec in &specs.final_equations {
        for input in spec.inputs() {
            check(&known, input, "final equation stat", &spec.out_name)?;
        }
    }
    Ok(())
}

/// Clamps an update interval to the configured minimum, warning when a
/// group asked for a faster cadence.
fn clamp_interval(seconds: u64, min_update_interval: u64, group_name: &str) -> u64 {
    if seconds < min_update_interval {
        warn!(
            "stat group '{}' is set to be queried every {}s, faster than the minimum of {}s; \
             clamping (set min_update_interval_override in [daemon] to allow it)",
            group_name, seconds, min_update_interval
        );
        return min_update_interval;
    }
    seconds
}

fn parse_multiplier(spec: &str, group_name: &str) -> Result<u64, ConfigError> {
    let rest = spec.strip_prefix('*').ok_or_else(|| {
        ConfigError::Invalid(format!(
            "invalid update_interval '{}' in group '{}' (expected seconds or \"*N\")",
            spec, group_name
        ))
    })?;
    if rest.is_empty() {
        return Ok(1);
    }
    rest.parse::<u64>().map_err(|e| {
        ConfigError::Invalid(format!(
            "failed to parse update interval multiplier from '{}' in group '{}': {}",
            spec, group_name, e
        ))
    })
}

fn configure_stat_group(
    daemon: &mut Daemon,
    group_name: &str,
    group: &GroupSection,
    global_entries: &[ClusterEntry],
    daemon_cfg: &DaemonSection,
    cluster_cache: &mut HashMap<String, ClusterConfig>,
    min_update_interval: u64,
) -> Result<(), ConfigError> {
    let mut entries: Vec<ClusterEntry> = global_entries.to_vec();
    for entry in &group.clusters {
        entries.push(parse_cluster_entry(entry)?);
    }
    let mut seen_addresses = BTreeSet::new();
    entries.retain(|entry| seen_addresses.insert(entry.address.clone()));
    if entries.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "stat group '{}' has no clusters to query; provide a global cluster list, \
             a per-group list, or both",
            group_name
        )));
    }
    let stats: BTreeSet<String> = group.stats.iter().cloned().collect();
    if stats.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "stat group '{}' has no stats to query",
            group_name
        )));
    }

    let specs = build_group_specs(group_name, group)?;
    validate_derived_inputs(group_name, &stats, &specs)?;

    let clusters: Vec<ClusterConfig> = entries
        .iter()
        .map(|entry| build_cluster_config(entry, daemon_cfg, cluster_cache))
        .collect::<Result<_, _>>()?;

    // interval -> (clusters, stats) to poll at that cadence
    let mut interval_work: BTreeMap<u64, (Vec<ClusterConfig>, BTreeSet<String>)> = BTreeMap::new();
    match &group.update_interval {
        UpdateIntervalParam::Seconds(seconds) => {
            interval_work.insert(*seconds, (clusters.clone(), stats.clone()));
        }
        UpdateIntervalParam::Resolve(spec) => {
            let multiplier = parse_multiplier(spec, group_name)?;
            info!("computing update intervals for stat group '{}'", group_name);
            let stat_names: Vec<String> = stats.iter().cloned().collect();
            for (interval, bucket) in resolve_update_intervals(multiplier, &clusters, &stat_names)? {
                interval_work.insert(interval, (bucket.clusters, bucket.stats));
            }
        }
    }

    if !specs.is_empty() {
        // derived stats need all of their inputs in one query, so the whole
        // group polls at the smallest resolved interval
        let Some(&smallest) = interval_work.keys().next() else {
            return Err(ConfigError::Invalid(format!(
                "no update interval resolved for stat group '{}'",
                group_name
            )));
        };
        let interval = clamp_interval(smallest, min_update_interval, group_name);
        let mut config = StatsConfig::new(clusters, stats, Duration::from_secs(interval));
        config.composite_stats = specs.composites;
        config.equation_stats = specs.equations;
        config.pct_change_stats = specs.pct_changes;
        config.final_equation_stats = specs.final_equations;
        daemon.add_stats(config);
    } else {
        for (interval, (bucket_clusters, bucket_stats)) in interval_work {
            let interval = clamp_interval(interval, min_update_interval, group_name);
            daemon.add_stats(StatsConfig::new(
                bucket_clusters,
                bucket_stats,
                Duration::from_secs(interval),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parse_cluster_entry_variants() {
        assert_eq!(
            parse_cluster_entry("cluster1.example.com").unwrap(),
            ClusterEntry {
                address: "cluster1.example.com".into(),
                username: None,
                password: None,
                verify_ssl: None,
            }
        );
        assert_eq!(
            parse_cluster_entry("admin:s3cret@cluster1.example.com").unwrap(),
            ClusterEntry {
                address: "cluster1.example.com".into(),
                username: Some("admin".into()),
                password: Some("s3cret".into()),
                verify_ssl: None,
            }
        );
        assert_eq!(
            parse_cluster_entry("admin:s3cret@cluster1.example.com:True").unwrap().verify_ssl,
            Some(true)
        );
        // passwords may contain ':' and '@'
        let entry = parse_cluster_entry("admin:p:as@s@cluster1.example.com:false").unwrap();
        assert_eq!(entry.username.as_deref(), Some("admin"));
        assert_eq!(entry.password.as_deref(), Some("p:as@s"));
        assert_eq!(entry.verify_ssl, Some(false));
    }

    #[test]
    fn parse_cluster_entry_rejects_garbage() {
        assert!(parse_cluster_entry("admin@cluster1.example.com").is_err());
        assert!(parse_cluster_entry("cluster1.example.com:maybe").is_err());
        assert!(parse_cluster_entry("").is_err());
    }

    #[test]
    fn parse_composite_stats_builds_output_names() {
        let composites = parse_composite_stats(
            "iops",
            &["avg(node.ifs.ops.in)".to_string(), "sum(node.proto.total:op_count)".to_string()],
        )
        .unwrap();
        assert_eq!(composites.len(), 2);
        assert_eq!(composites[0].out_name, "cluster.node.ifs.ops.in.avg");
        assert_eq!(composites[0].op, CompositeOp::Avg);
        assert_eq!(composites[1].out_name, "cluster.node.proto.total.op_count.sum");
        assert_eq!(composites[1].input.name, "node.proto.total");
    }

    #[test]
    fn parse_composite_stats_rejects_bad_definitions() {
        for bad in ["median(node.x)", "avg(cluster.x)", "avgnode.x", "avg(node.x"] {
            assert!(
                parse_composite_stats("iops", &[bad.to_string()]).is_err(),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn percent_change_output_names_append_suffix() {
        let specs = parse_pct_change_stats(&["node.ifs.bytes.used:total".to_string()]);
        assert_eq!(specs[0].out_name, "node.ifs.bytes.used.total.percentchange");
        assert_eq!(specs[0].input.name, "node.ifs.bytes.used");
    }

    #[test]
    fn validation_accepts_upstream_outputs_and_rejects_unknowns() {
        let group = GroupSection {
            clusters: Vec::new(),
            stats: vec!["node.ops.in".to_string(), "node.ops.out".to_string()],
            update_interval: UpdateIntervalParam::Seconds(30),
            composite_stats: vec!["sum(node.ops.in)".to_string()],
            equation_stats: [(
                "cluster.ops.scaled".to_string(),
                "cluster.node.ops.in.sum * 2".to_string(),
            )]
            .into_iter()
            .collect(),
            percent_change_stats: vec!["cluster.ops.scaled".to_string()],
            final_equation_stats: [(
                "cluster.ops.final".to_string(),
                "cluster.ops.scaled.percentchange + node.ops.out".to_string(),
            )]
            .into_iter()
            .collect(),
        };
        let stats: BTreeSet<String> = group.stats.iter().cloned().collect();
        let specs = build_group_specs("iops", &group).unwrap();
        validate_derived_inputs("iops", &stats, &specs).unwrap();

        // an equation referencing a stat the group does not poll is fatal
        let mut bad = GroupSpecs::default();
        bad.equations = build_equation_specs(
            "iops",
            &[("out".to_string(), "node.not.polled + 1".to_string())]
                .into_iter()
                .collect(),
        )
        .unwrap();
        assert!(validate_derived_inputs("iops", &stats, &bad).is_err());
    }

    #[test]
    fn clamp_interval_enforces_the_minimum() {
        assert_eq!(clamp_interval(10, MIN_UPDATE_INTERVAL, "iops"), MIN_UPDATE_INTERVAL);
        assert_eq!(clamp_interval(60, MIN_UPDATE_INTERVAL, "iops"), 60);
        // override lowers the floor
        assert_eq!(clamp_interval(10, 5, "iops"), 10);
    }

    #[test]
    fn parse_multiplier_variants() {
        assert_eq!(parse_multiplier("*", "g").unwrap(), 1);
        assert_eq!(parse_multiplier("*3", "g").unwrap(), 3);
        assert!(parse_multiplier("3", "g").is_err());
        assert!(parse_multiplier("*x", "g").is_err());
    }

    #[test]
    fn load_file_parses_a_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[daemon]
processor = "influxdb"
processor_args = ["localhost", "8086", "statpoll"]
clusters = ["admin:s3cret@cluster1.example.com"]
active_stat_groups = ["cluster_iops", "protocol_ops"]

[group.cluster_iops]
update_interval = 30
stats = ["node.ifs.ops.in", "node.ifs.ops.out"]
composite_stats = ["avg(node.ifs.ops.in)"]
percent_change_stats = ["node.ifs.ops.in"]

[group.cluster_iops.equation_stats]
"cluster.ifs.ops.scaled" = "cluster.node.ifs.ops.in.avg * 2"

[group.protocol_ops]
update_interval = "*2"
stats = ["node.protostats.nfs.total:op_count"]
"#
        )
        .unwrap();

        let config = load_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.daemon.processor.as_deref(), Some("influxdb"));
        assert_eq!(config.daemon.active_stat_groups.len(), 2);

        let iops = &config.group["cluster_iops"];
        assert!(matches!(iops.update_interval, UpdateIntervalParam::Seconds(30)));
        assert_eq!(iops.composite_stats.len(), 1);
        assert_eq!(iops.equation_stats.len(), 1);

        let proto = &config.group["protocol_ops"];
        match &proto.update_interval {
            UpdateIntervalParam::Resolve(spec) => assert_eq!(spec, "*2"),
            other => panic!("expected resolve interval, got {:?}", other),
        }
    }

    #[test]
    fn load_file_rejects_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[daemon\nprocessor = ").unwrap();
        assert!(matches!(
            load_file(file.path().to_str().unwrap()),
            Err(ConfigError::Parse(_))
        ));
    }
}
