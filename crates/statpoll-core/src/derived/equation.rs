//! Equation stats: an arithmetic expression over several input stats,
//! computed once per node.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::expr::{Expr, Num};
use super::{DerivedStatComputer, DerivedStatInput, SelectedTimestamps, err_stat, ok_stat};
use crate::stats::{Stat, StatValue};

/// Configuration of one equation stat: a compiled expression plus its
/// inputs, one per operand occurrence, in expression order.
#[derive(Debug, Clone)]
pub struct EquationSpec {
    pub out_name: String,
    expr: Expr,
    inputs: Vec<DerivedStatInput>,
}

impl EquationSpec {
    pub fn new(out_name: impl Into<String>, expr: Expr, inputs: Vec<DerivedStatInput>) -> Self {
        EquationSpec {
            out_name: out_name.into(),
            expr,
            inputs,
        }
    }

    pub fn inputs(&self) -> &[DerivedStatInput] {
        &self.inputs
    }
}

/// Computes one equation output per node seen across any input.
///
/// Inputs whose name starts with `cluster.` are cluster-scoped: every node's
/// argument vector reads them at devid 0.
pub struct EquationComputer {
    spec: EquationSpec,
    /// Base stat name to the argument positions it feeds. Several positions
    /// can share a name when the expression reads different fields of one
    /// stat, or repeats an operand.
    positions_by_name: HashMap<String, Vec<usize>>,
    /// Selected values, per argument position, per devid.
    selected: HashMap<usize, HashMap<i64, StatValue>>,
    nodes: BTreeSet<i64>,
    timestamps: SelectedTimestamps,
}

impl EquationComputer {
    pub fn new(spec: &EquationSpec) -> Self {
        let mut positions_by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, input) in spec.inputs.iter().enumerate() {
            positions_by_name
                .entry(input.name.clone())
                .or_default()
                .push(position);
        }
        EquationComputer {
            spec: spec.clone(),
            positions_by_name,
            selected: HashMap::new(),
            nodes: BTreeSet::new(),
            timestamps: SelectedTimestamps::default(),
        }
    }

    /// The argument vector for one node, or an error message when a selected
    /// input is non-numeric. `None` entries are missing inputs.
    fn node_args(&self, node: i64) -> Result<Vec<Option<Num>>, String> {
        let mut args = Vec::with_capacity(self.spec.inputs.len());
        for (position, input) in self.spec.inputs.iter().enumerate() {
            let lookup_node = if input.name.starts_with("cluster.") { 0 } else { node };
            let value = self
                .selected
                .get(&position)
                .and_then(|by_node| by_node.get(&lookup_node));
            match value {
                None => args.push(None),
                Some(StatValue::Null) => args.push(None),
                Some(value) => match Num::from_value(value) {
                    Some(num) => args.push(Some(num)),
                    None => {
                        return Err(format!(
                            "non-numeric value {} for input {}",
                            value,
                            input.full_name()
                        ));
                    }
                },
            }
        }
        Ok(args)
    }
}

impl DerivedStatComputer for EquationComputer {
    fn begin(&mut self, _cluster_name: &str) {
        self.selected.clear();
        self.nodes.clear();
        self.timestamps.clear();
    }

    fn select(&mut self, stat: &Stat) {
        let Some(positions) = self.positions_by_name.get(&stat.key) else {
            return;
        };
        self.timestamps.record(stat.devid, stat.time);
        self.nodes.insert(stat.devid);
        for &position in positions {
            let value = self.spec.inputs[position].get_value(&stat.value);
            self.selected.entry(position).or_default().insert(stat.devid, value);
        }
    }

    fn compute(&mut self) -> Vec<Stat> {
        let out_name = &self.spec.out_name;
        let mut outputs = Vec::new();
        for &node in &self.nodes {
            let args = match self.node_args(node) {
                Ok(args) => args,
                Err(message) => {
                    outputs.push(err_stat(
                        out_name,
                        node,
                        &self.timestamps,
                        format!("failed to gather inputs for stat {}: {}", out_name, message),
                    ));
                    continue;
                }
            };
            // a null argument becomes a zero of the same numeric type as any
            // non-null argument; if every argument is null there is nothing
            // to compute for this node
            let Some(zero) = args.iter().flatten().next().map(|n| n.zero_like()) else {
                continue;
            };
            let args: Vec<Num> = args.into_iter().map(|a| a.unwrap_or(zero)).collect();
            debug!("equation [{}] {}({:?})", node, out_name, args);
            match self.spec.expr.eval(&args) {
                Ok(result) => outputs.push(ok_stat(out_name, node, result.into(), &self.timestamps)),
                Err(error) => outputs.push(err_stat(
                    out_name,
                    node,
                    &self.timestamps,
                    format!(
                        "failed to evaluate expression for stat {}, input params {:?}: {}",
                        out_name, args, error
                    ),
                )),
            }
        }
        outputs
    }

    fn end(&mut self, _cluster_name: &str) {}
}

#[cfg(test)]
mod tests {
    use super::super::expr;
    use super::*;

    fn build(out_name: &str, expression: &str) -> EquationComputer {
        let (parsed, names) = expr::parse(expression).unwrap();
        let inputs = names.iter().map(|n| DerivedStatInput::parse(n)).collect();
        EquationComputer::new(&EquationSpec::new(out_name, parsed, inputs))
    }

    #[test]
    fn computes_one_output_per_node() {
        let mut computer = build("node.ops.total", "node.ops.in + node.ops.out");
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ops.in", 1, 100, StatValue::Int(10)));
        computer.select(&Stat::new("node.ops.in", 2, 100, StatValue::Int(20)));
        computer.select(&Stat::new("node.ops.out", 1, 100, StatValue::Int(1)));
        computer.select(&Stat::new("node.ops.out", 2, 100, StatValue::Int(2)));
        let out = computer.compute();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].devid, 1);
        assert_eq!(out[0].value, StatValue::Int(11));
        assert_eq!(out[1].devid, 2);
        assert_eq!(out[1].value, StatValue::Int(22));
    }

    #[test]
    fn null_input_becomes_typed_zero() {
        let mut computer = build("node.ops.total", "node.ops.in + node.ops.out");
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ops.in", 1, 100, StatValue::Int(10)));
        computer.select(&Stat::new("node.ops.out", 1, 100, StatValue::Null));
        let out = computer.compute();
        assert_eq!(out.len(), 1);
        assert!(out[0].error.is_none());
        assert_eq!(out[0].value, StatValue::Int(10));
    }

    #[test]
    fn all_null_inputs_produce_no_output() {
        let mut computer = build("node.ops.total", "node.ops.in + node.ops.out");
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ops.in", 1, 100, StatValue::Null));
        computer.select(&Stat::new("node.ops.out", 1, 100, StatValue::Null));
        assert!(computer.compute().is_empty());
    }

    #[test]
    fn cluster_inputs_resolve_at_devid_zero() {
        let mut computer = build(
            "node.ops.share",
            "node.ops.in / cluster.node.ops.in.sum",
        );
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ops.in", 1, 100, StatValue::Int(10)));
        computer.select(&Stat::new("node.ops.in", 2, 100, StatValue::Int(30)));
        computer.select(&Stat::new("cluster.node.ops.in.sum", 0, 100, StatValue::Int(40)));
        let out = computer.compute();
        // devid 0 saw only the cluster stat, so its own args are (null, 40)
        // -> in coerced to integer zero -> 0.0; nodes 1 and 2 divide by the
        // shared cluster value.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].devid, 0);
        assert_eq!(out[0].value, StatValue::Float(0.0));
        assert_eq!(out[1].value, StatValue::Float(0.25));
        assert_eq!(out[2].value, StatValue::Float(0.75));
    }

    #[test]
    fn evaluation_failure_is_an_error_stat() {
        let mut computer = build("node.ops.ratio", "node.ops.in / node.ops.out");
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ops.in", 1, 100, StatValue::Int(10)));
        computer.select(&Stat::new("node.ops.out", 1, 100, StatValue::Int(0)));
        let out = computer.compute();
        assert_eq!(out.len(), 1);
        assert!(out[0].error.as_deref().unwrap().contains("division by zero"));
    }

    #[test]
    fn field_inputs_read_their_own_fields() {
        let mut computer = build(
            "proto.total.ops",
            "proto.nfs.total:op_count + proto.nfs.total:op_rate",
        );
        computer.begin("mycluster");
        let value = StatValue::Map(
            [
                ("op_count".to_string(), StatValue::Int(5)),
                ("op_rate".to_string(), StatValue::Int(2)),
            ]
            .into_iter()
            .collect(),
        );
        computer.select(&Stat::new("proto.nfs.total", 1, 100, value));
        let out = computer.compute();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, StatValue::Int(7));
    }

    #[test]
    fn output_time_is_the_mean_of_input_times() {
        let mut computer = build("node.ops.total", "node.ops.in + node.ops.out");
        computer.begin("mycluster");
        computer.select(&Stat::new("node.ops.in", 1, 100, StatValue::Int(1)));
        computer.select(&Stat::new("node.ops.out", 1, 200, StatValue::Int(2)));
        assert_eq!(computer.compute()[0].time, 150);
    }
}
