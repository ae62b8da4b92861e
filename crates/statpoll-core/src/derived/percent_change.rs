//! Percent-change stats: change of one input relative to its value in the
//! previous polling interval, per node.
//!
//! Previous values persist across ticks in a shared store keyed by spec id
//! and cluster name. Each fan-out job builds its own computer; the scheduler
//! runs at most one job per cluster at a time, so the store sees no
//! contention.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{DerivedStatComputer, DerivedStatInput, SelectedTimestamps, err_stat, ok_stat};
use crate::stats::{Stat, StatValue};

static NEXT_SPEC_ID: AtomicUsize = AtomicUsize::new(0);

/// Configuration of one percent-change stat. The id distinguishes otherwise
/// identical specs in the shared previous-values store.
#[derive(Debug, Clone)]
pub struct PctChangeSpec {
    pub id: usize,
    pub input: DerivedStatInput,
    pub out_name: String,
}

impl PctChangeSpec {
    pub fn new(input: DerivedStatInput, out_name: impl Into<String>) -> Self {
        PctChangeSpec {
            id: NEXT_SPEC_ID.fetch_add(1, Ordering::Relaxed),
            input,
            out_name: out_name.into(),
        }
    }
}

/// Committed values from the previous interval, per (spec id, cluster name),
/// per devid.
type PrevValues = HashMap<(usize, String), HashMap<i64, f64>>;

pub type SharedPrevValues = Arc<Mutex<PrevValues>>;

pub fn new_prev_values() -> SharedPrevValues {
    Arc::new(Mutex::new(HashMap::new()))
}

pub struct PercentChangeComputer {
    spec: PctChangeSpec,
    store: SharedPrevValues,
    cluster_name: String,
    /// Snapshot of the previous interval's values, loaded in `begin`.
    prev: HashMap<i64, f64>,
    /// Current values per devid; `None` when the input's value was null or
    /// non-numeric.
    current: BTreeMap<i64, Option<f64>>,
    timestamps: SelectedTimestamps,
}

impl PercentChangeComputer {
    pub fn new(spec: &PctChangeSpec, store: &SharedPrevValues) -> Self {
        PercentChangeComputer {
            spec: spec.clone(),
            store: Arc::clone(store),
            cluster_name: String::new(),
            prev: HashMap::new(),
            current: BTreeMap::new(),
            timestamps: SelectedTimestamps::default(),
        }
    }

    fn percent_change(&self, node: i64, current: f64) -> f64 {
        let Some(&previous) = self.prev.get(&node) else {
            // first interval for this node
            return 0.0;
        };
        debug!(
            "percent change [{}] = ({} / {}) - 1",
            node, current, previous
        );
        if previous != 0.0 {
            ((current / previous) - 1.0) * 100.0
        } else if current == 0.0 {
            0.0
        } else {
            // previous was zero: the inverse ratio, sign-flipped, keeps the
            // result finite without losing direction
            -(((previous / current) - 1.0) * 100.0)
        }
    }
}

impl DerivedStatComputer for PercentChangeComputer {
    fn begin(&mut self, cluster_name: &str) {
        self.cluster_name = cluster_name.to_string();
        self.current.clear();
        self.timestamps.clear();
        self.prev = self
            .store
            .lock()
            .get(&(self.spec.id, self.cluster_name.clone()))
            .cloned()
            .unwrap_or_default();
    }

    fn select(&mut self, stat: &Stat) {
        if stat.key == self.spec.input.name {
            let value = self.spec.input.get_value(&stat.value);
            self.current.insert(stat.devid, value.as_f64());
            self.timestamps.record(stat.devid, stat.time);
        }
    }

    fn compute(&mut self) -> Vec<Stat> {
        let out_name = &self.spec.out_name;
        let mut outputs = Vec::new();
        for (&node, &current) in &self.current {
            match current {
                Some(current) => {
                    let change = self.percent_change(node, current);
                    outputs.push(ok_stat(
                        out_name,
                        node,
                        StatValue::Float(change),
                        &self.timestamps,
                    ));
                }
                None => outputs.push(err_stat(
                    out_name,
                    node,
                    &self.timestamps,
                    format!(
                        "unable to determine current value of input stat {}",
                        self.spec.input.full_name()
                    ),
                )),
            }
        }
        outputs
    }

    /// Commits current values as the next interval's previous values. Nodes
    /// without a numeric current value are dropped and start cold again.
    fn end(&mut self, cluster_name: &str) {
        let committed: HashMap<i64, f64> = self
            .current
            .iter()
            .filter_map(|(&node, &value)| value.map(|v| (node, v)))
            .collect();
        self.store
            .lock()
            .insert((self.spec.id, cluster_name.to_string()), committed);
    }
}
