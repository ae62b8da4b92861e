//! Cluster composite stats: one aggregate value over all node values of a
//! single input stat.

use tracing::debug;

use super::expr::Num;
use super::{DerivedStatComputer, DerivedStatInput, SelectedTimestamps, err_stat, ok_stat};
use crate::stats::{Stat, StatValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    Avg,
    Min,
    Max,
    Sum,
}

impl CompositeOp {
    pub fn parse(name: &str) -> Option<CompositeOp> {
        match name {
            "avg" => Some(CompositeOp::Avg),
            "min" => Some(CompositeOp::Min),
            "max" => Some(CompositeOp::Max),
            "sum" => Some(CompositeOp::Sum),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompositeOp::Avg => "avg",
            CompositeOp::Min => "min",
            CompositeOp::Max => "max",
            CompositeOp::Sum => "sum",
        }
    }
}

/// Configuration of one composite stat.
#[derive(Debug, Clone)]
pub struct CompositeSpec {
    pub input: DerivedStatInput,
    pub out_name: String,
    pub op: CompositeOp,
}

/// Computes one cluster-level aggregate per result set. Always produces
/// exactly one output stat, with `devid` 0.
pub struct CompositeComputer {
    spec: CompositeSpec,
    values: Vec<StatValue>,
    timestamps: SelectedTimestamps,
}

impl CompositeComputer {
    pub fn new(spec: &CompositeSpec) -> Self {
        CompositeComputer {
            spec: spec.clone(),
            values: Vec::new(),
            timestamps: SelectedTimestamps::default(),
        }
    }

    fn apply(&self, values: &[Num]) -> Result<Num, String> {
        let mut iter = values.iter().copied();
        let first = iter
            .next()
            .ok_or_else(|| "no input values selected".to_string())?;
        match self.spec.op {
            CompositeOp::Sum => {
                let mut total = first;
                for value in iter {
                    total = total.add(value).map_err(|e| e.to_string())?;
                }
                Ok(total)
            }
            CompositeOp::Avg => {
                let mut total = first;
                for value in iter {
                    total = total.add(value).map_err(|e| e.to_string())?;
                }
                Ok(Num::Float(total.as_f64() / values.len() as f64))
            }
            CompositeOp::Min => {
                let mut best = first;
                for value in iter {
                    if value.as_f64() < best.as_f64() {
                        best = value;
                    }
                }
                Ok(best)
            }
            CompositeOp::Max => {
                let mut best = first;
                for value in iter {
                    if value.as_f64() > best.as_f64() {
                        best = value;
                    }
                }
                Ok(best)
            }
        }
    }
}

impl DerivedStatComputer for CompositeComputer {
    fn begin(&mut self, _cluster_name: &str) {
        self.values.clear();
        self.timestamps.clear();
    }

    fn select(&mut self, stat: &Stat) {
        if stat.key == self.spec.input.name {
            self.values.push(self.spec.input.get_value(&stat.value));
            self.timestamps.record(stat.devid, stat.time);
        }
    }

    fn compute(&mut self) -> Vec<Stat> {
        let out_name = &self.spec.out_name;
        if self.values.is_empty() {
            return vec![err_stat(
                out_name,
                0,
                &self.timestamps,
                format!("no input values selected for stat {}", out_name),
            )];
        }
        let mut nums = Vec::with_capacity(self.values.len());
        for value in &self.values {
            match Num::from_value(value) {
                Some(num) => nums.push(num),
                None => {
                    return vec![err_stat(
                        out_name,
                        0,
                        &self.timestamps,
                        format!(
                            "non-numeric input value {} for stat {}",
                            value, out_name
                        ),
                    )];
                }
            }
        }
        debug!("composite {}({:?})", self.spec.op.name(), nums);
        match self.apply(&nums) {
            Ok(result) => vec![ok_stat(out_name, 0, result.into(), &self.timestamps)],
            Err(error) => vec![err_stat(
                out_name,
                0,
                &self.timestamps,
                format!("failed to compute stat {}: {}", out_name, error),
            )],
        }
    }

    fn end(&mut self, _cluster_name: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(op: CompositeOp) -> CompositeSpec {
        CompositeSpec {
            input: DerivedStatInput::new("node.ifs.ops.in", None),
            out_name: format!("cluster.node.ifs.ops.in.{}", op.name()),
            op,
        }
    }

    fn feed(computer: &mut CompositeComputer, values: &[(i64, i64, i64)]) {
        computer.begin("mycluster");
        for &(devid, time, value) in values {
            computer.select(&Stat::new("node.ifs.ops.in", devid, time, StatValue::Int(value)));
        }
    }

    #[test]
    fn avg_over_three_nodes() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Avg));
        feed(&mut computer, &[(1, 100, 10), (2, 110, 20), (3, 120, 30)]);
        let out = computer.compute();
        assert_eq!(out.len(), 1);
        let stat = &out[0];
        assert_eq!(stat.key, "cluster.node.ifs.ops.in.avg");
        assert_eq!(stat.devid, 0);
        assert_eq!(stat.value, StatValue::Float(20.0));
        assert_eq!(stat.time, 110);
        assert!(stat.error.is_none());
    }

    #[test]
    fn sum_preserves_integer_type() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Sum));
        feed(&mut computer, &[(1, 100, 10), (2, 100, 20)]);
        assert_eq!(computer.compute()[0].value, StatValue::Int(30));
    }

    #[test]
    fn min_and_max() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Min));
        feed(&mut computer, &[(1, 100, 10), (2, 100, 20)]);
        assert_eq!(computer.compute()[0].value, StatValue::Int(10));

        let mut computer = CompositeComputer::new(&spec(CompositeOp::Max));
        feed(&mut computer, &[(1, 100, 10), (2, 100, 20)]);
        assert_eq!(computer.compute()[0].value, StatValue::Int(20));
    }

    #[test]
    fn no_selected_values_is_an_error_stat() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Avg));
        computer.begin("mycluster");
        let out = computer.compute();
        assert_eq!(out.len(), 1);
        assert!(out[0].error.is_some());
    }

    #[test]
    fn non_numeric_value_is_an_error_stat() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Avg));
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ifs.ops.in", 1, 100, StatValue::Str("n/a".into())));
        assert!(computer.compute()[0].error.is_some());
    }

    #[test]
    fn other_keys_are_ignored() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Sum));
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ifs.ops.out", 1, 100, StatValue::Int(5)));
        assert!(computer.compute()[0].error.is_some());
    }

    #[test]
    fn begin_resets_state_between_clusters() {
        let mut computer = CompositeComputer::new(&spec(CompositeOp::Sum));
        feed(&mut computer, &[(1, 100, 10)]);
        assert_eq!(computer.compute()[0].value, StatValue::Int(10));
        feed(&mut computer, &[(1, 100, 7)]);
        assert_eq!(computer.compute()[0].value, StatValue::Int(7));
    }
}
