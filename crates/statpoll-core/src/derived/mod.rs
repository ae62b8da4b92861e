//! Derived statistics.
//!
//! Four computer kinds produce values from raw query results, in dependency
//! order:
//! - `composite` — cluster-level aggregate (avg/min/max/sum) over all node
//!   values of one input stat
//! - `equation` — arithmetic expression over several inputs, one output per
//!   node
//! - `percent_change` — change of one input relative to the previous polling
//!   interval, one output per node
//! - `final_equation` — a second equation pass that may reference
//!   percent-change outputs
//!
//! Every computer implements the same contract
//! ([`DerivedStatComputer`]): `begin` resets per-cluster buffers, `select`
//! inspects each stat flowing through the pipeline and records matching
//! inputs, `compute` produces the outputs, `end` post-processes. The
//! [`pipeline::DerivedStatsPipeline`] drives the tiers in order.

mod composite;
mod equation;
pub mod expr;
mod percent_change;
mod pipeline;

use std::collections::HashMap;

pub use composite::{CompositeComputer, CompositeOp, CompositeSpec};
pub use equation::{EquationComputer, EquationSpec};
pub use percent_change::{
    PctChangeSpec, PercentChangeComputer, SharedPrevValues, new_prev_values,
};
pub use pipeline::DerivedStatsPipeline;

use crate::stats::{Stat, StatValue};

/// A derived-stat input: a stat name plus an optional field path into the
/// stat's (possibly nested) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedStatInput {
    pub name: String,
    fields: Option<Vec<String>>,
}

impl DerivedStatInput {
    pub fn new(name: impl Into<String>, fields: Option<Vec<String>>) -> Self {
        DerivedStatInput {
            name: name.into(),
            fields: fields.filter(|f| !f.is_empty()),
        }
    }

    /// Parses `stat.name:field:subfield` syntax.
    pub fn parse(text: &str) -> Self {
        match text.split_once(':') {
            Some((name, fields)) => DerivedStatInput::new(
                name,
                Some(fields.split(':').map(str::to_string).collect()),
            ),
            None => DerivedStatInput::new(text, None),
        }
    }

    /// Name plus field path, `:`-joined. Distinguishes two inputs reading
    /// different fields of the same stat.
    pub fn full_name(&self) -> String {
        match &self.fields {
            Some(fields) => format!("{}:{}", self.name, fields.join(":")),
            None => self.name.clone(),
        }
    }

    /// Extracts this input's scalar from a stat value.
    ///
    /// The statistics API has a habit of wrapping single values in a
    /// one-element sequence; those unwrap transparently. A missing field
    /// along the path yields `Null`, which downstream computation treats as
    /// a missing input, never as zero.
    pub fn get_value(&self, value: &StatValue) -> StatValue {
        let unwrapped = match value {
            StatValue::List(items) if items.len() == 1 => &items[0],
            other => other,
        };
        let Some(fields) = &self.fields else {
            return unwrapped.clone();
        };
        let mut current = unwrapped;
        for field in fields {
            match current {
                StatValue::Map(map) => match map.get(field) {
                    Some(next) => current = next,
                    None => return StatValue::Null,
                },
                _ => return StatValue::Null,
            }
        }
        current.clone()
    }
}

/// The uniform contract all derived-stat computers implement.
pub trait DerivedStatComputer {
    /// Resets internal buffers for a new cluster result set.
    fn begin(&mut self, cluster_name: &str);
    /// Records `stat` if its key is one of this computer's inputs.
    fn select(&mut self, stat: &Stat);
    /// Produces the derived outputs for the selected inputs.
    fn compute(&mut self) -> Vec<Stat>;
    /// Post-processes after the cluster's results are done.
    fn end(&mut self, cluster_name: &str);
}

/// Timestamps of selected input stats, per devid. Derived outputs carry the
/// arithmetic mean of their inputs' timestamps.
#[derive(Debug, Default)]
struct SelectedTimestamps {
    by_devid: HashMap<i64, Vec<i64>>,
}

impl SelectedTimestamps {
    fn record(&mut self, devid: i64, time: i64) {
        self.by_devid.entry(devid).or_default().push(time);
    }

    /// Mean for one devid. A cluster-level output (devid 0) with no
    /// cluster-level inputs falls back to the mean across all nodes.
    fn mean(&self, devid: i64) -> Option<i64> {
        if let Some(times) = self.by_devid.get(&devid) {
            return mean_of(times);
        }
        if devid == 0 {
            let all: Vec<i64> = self.by_devid.values().flatten().copied().collect();
            return mean_of(&all);
        }
        None
    }

    fn clear(&mut self) {
        self.by_devid.clear();
    }
}

fn mean_of(times: &[i64]) -> Option<i64> {
    if times.is_empty() {
        return None;
    }
    Some(times.iter().sum::<i64>() / times.len() as i64)
}

/// A successful derived stat, timestamped with the mean of its inputs. If
/// the mean cannot be computed (nothing was selected for this devid) the
/// stat degrades to an error stat.
fn ok_stat(out_name: &str, devid: i64, value: StatValue, timestamps: &SelectedTimestamps) -> Stat {
    match timestamps.mean(devid) {
        Some(time) => Stat::new(out_name, devid, time, value),
        None => Stat::with_error(
            out_name,
            devid,
            format!(
                "no input timestamps recorded for stat {} on node {}",
                out_name, devid
            ),
        ),
    }
}

fn err_stat(out_name: &str, devid: i64, timestamps: &SelectedTimestamps, error: String) -> Stat {
    Stat {
        key: out_name.to_string(),
        devid,
        time: timestamps.mean(devid).unwrap_or(0),
        value: StatValue::Null,
        error: Some(error),
    }
}
