//! Drives one cluster's query results through the derived-stat tiers and
//! into the stats processor.
//!
//! Tier order is the design contract: raw stats feed every computer;
//! composite outputs feed equations, percent-change, and final equations;
//! equation outputs feed percent-change and final equations; percent-change
//! outputs feed final equations. Downstream tiers observe upstream outputs,
//! never the reverse. A derived stat carrying an error is logged and never
//! fed forward.

use tracing::{debug, warn};

use super::{
    CompositeComputer, CompositeSpec, DerivedStatComputer, EquationComputer, EquationSpec,
    PctChangeSpec, PercentChangeComputer, SharedPrevValues,
};
use crate::processor::ProcessorAdapter;
use crate::stats::Stat;

pub struct DerivedStatsPipeline {
    composites: Vec<CompositeComputer>,
    equations: Vec<EquationComputer>,
    pct_changes: Vec<PercentChangeComputer>,
    final_equations: Vec<EquationComputer>,
}

impl DerivedStatsPipeline {
    /// Builds the per-job computers from a cluster's spec lists. Percent
    /// change computers attach to the shared previous-values store.
    pub fn new(
        composites: &[CompositeSpec],
        equations: &[EquationSpec],
        pct_changes: &[PctChangeSpec],
        final_equations: &[EquationSpec],
        prev_values: &SharedPrevValues,
    ) -> Self {
        DerivedStatsPipeline {
            composites: composites.iter().map(CompositeComputer::new).collect(),
            equations: equations.iter().map(EquationComputer::new).collect(),
            pct_changes: pct_changes
                .iter()
                .map(|spec| PercentChangeComputer::new(spec, prev_values))
                .collect(),
            final_equations: final_equations.iter().map(EquationComputer::new).collect(),
        }
    }

    /// Feeds one cluster's query results to the processor, computing derived
    /// stats tier by tier.
    ///
    /// With a batch processor the raw results are handed over in one call
    /// and no derived stats are computed.
    pub fn process(
        &mut self,
        cluster_name: &str,
        mut results: Vec<Stat>,
        processor: &ProcessorAdapter,
    ) {
        if !processor.supports_derived_stats() {
            for stat in &mut results {
                stat.prep_value();
            }
            processor.process_batch(cluster_name, &results);
            return;
        }

        debug!("processing stat results on {}", cluster_name);
        processor.begin_process(cluster_name);
        for computer in self.computers_mut() {
            computer.begin(cluster_name);
        }

        for mut stat in results {
            if let Some(error) = &stat.error {
                warn!(
                    "query for stat '{}' on '{}' returned error: '{}'",
                    stat.key, cluster_name, error
                );
                continue;
            }
            stat.prep_value();
            processor.process_stat(cluster_name, &stat);
            for computer in self.computers_mut() {
                computer.select(&stat);
            }
        }

        debug!("processing composite stats on {}", cluster_name);
        for i in 0..self.composites.len() {
            for stat in self.composites[i].compute() {
                if skip_errored("cluster composite stat", &stat, cluster_name) {
                    continue;
                }
                processor.process_stat(cluster_name, &stat);
                for computer in &mut self.equations {
                    computer.select(&stat);
                }
                for computer in &mut self.pct_changes {
                    computer.select(&stat);
                }
                for computer in &mut self.final_equations {
                    computer.select(&stat);
                }
            }
        }

        debug!("processing equation stats on {}", cluster_name);
        for i in 0..self.equations.len() {
            for stat in self.equations[i].compute() {
                if skip_errored("equation stat", &stat, cluster_name) {
                    continue;
                }
                processor.process_stat(cluster_name, &stat);
                for computer in &mut self.pct_changes {
                    computer.select(&stat);
                }
                for computer in &mut self.final_equations {
                    computer.select(&stat);
                }
            }
        }

        debug!("processing percent change stats on {}", cluster_name);
        for i in 0..self.pct_changes.len() {
            for stat in self.pct_changes[i].compute() {
                if skip_errored("percent change stat", &stat, cluster_name) {
                    continue;
                }
                processor.process_stat(cluster_name, &stat);
                for computer in &mut self.final_equations {
                    computer.select(&stat);
                }
            }
        }

        debug!("processing final equation stats on {}", cluster_name);
        for i in 0..self.final_equations.len() {
            for stat in self.final_equations[i].compute() {
                if skip_errored("final equation stat", &stat, cluster_name) {
                    continue;
                }
                processor.process_stat(cluster_name, &stat);
            }
        }

        for computer in self.computers_mut() {
            computer.end(cluster_name);
        }
        processor.end_process(cluster_name);
    }

    fn computers_mut(&mut self) -> impl Iterator<Item = &mut dyn DerivedStatComputer> {
        let composites = self
            .composites
            .iter_mut()
            .map(|c| c as &mut dyn DerivedStatComputer);
        let equations = self
            .equations
            .iter_mut()
            .map(|c| c as &mut dyn DerivedStatComputer);
        let pct_changes = self
            .pct_changes
            .iter_mut()
            .map(|c| c as &mut dyn DerivedStatComputer);
        let final_equations = self
            .final_equations
            .iter_mut()
            .map(|c| c as &mut dyn DerivedStatComputer);
        composites.chain(equations).chain(pct_changes).chain(final_equations)
    }
}

fn skip_errored(kind: &str, stat: &Stat, cluster_name: &str) -> bool {
    match &stat.error {
        Some(error) => {
            warn!(
                "{} '{}' on '{}' returned error: '{}'",
                kind, stat.key, cluster_name, error
            );
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::super::{CompositeOp, DerivedStatInput, expr, new_prev_values};
    use super::*;
    use crate::processor::{BatchProcessor, StreamingProcessor};
    use crate::stats::StatValue;

    /// Records every processor call in order.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl StreamingProcessor for &'static Recorder {
        fn begin_process(&self, cluster_name: &str) {
            self.events.lock().push(format!("begin {}", cluster_name));
        }

        fn process_stat(&self, _cluster_name: &str, stat: &Stat) {
            self.events
                .lock()
                .push(format!("stat {}[{}]={}", stat.key, stat.devid, stat.value));
        }

        fn end_process(&self, cluster_name: &str) {
            self.events.lock().push(format!("end {}", cluster_name));
        }
    }

    fn recorder() -> &'static Recorder {
        Box::leak(Box::new(Recorder::default()))
    }

    fn composite_spec() -> CompositeSpec {
        CompositeSpec {
            input: DerivedStatInput::new("node.ops.in", None),
            out_name: "cluster.node.ops.in.sum".into(),
            op: CompositeOp::Sum,
        }
    }

    fn equation_spec(out_name: &str, text: &str) -> EquationSpec {
        let (parsed, names) = expr::parse(text).unwrap();
        let inputs = names.iter().map(|n| DerivedStatInput::parse(n)).collect();
        EquationSpec::new(out_name, parsed, inputs)
    }

    #[test]
    fn tiers_run_in_order_and_feed_forward() {
        let rec = recorder();
        let prev = new_prev_values();
        let mut pipeline = DerivedStatsPipeline::new(
            &[composite_spec()],
            &[equation_spec("cluster.ops.double", "cluster.node.ops.in.sum * 2")],
            &[PctChangeSpec::new(
                DerivedStatInput::new("cluster.ops.double", None),
                "cluster.ops.double.percentchange",
            )],
            &[equation_spec(
                "cluster.ops.final",
                "cluster.ops.double.percentchange + 1",
            )],
            &prev,
        );
        let results = vec![
            Stat::new("node.ops.in", 1, 100, StatValue::Int(10)),
            Stat::new("node.ops.in", 2, 100, StatValue::Int(20)),
        ];
        pipeline.process("mycluster", results, &ProcessorAdapter::Streaming(Box::new(rec)));

        let events = rec.events();
        assert_eq!(
            events,
            vec![
                "begin mycluster",
                "stat node.ops.in[1]=10",
                "stat node.ops.in[2]=20",
                "stat cluster.node.ops.in.sum[0]=30",
                "stat cluster.ops.double[0]=60",
                "stat cluster.ops.double.percentchange[0]=0.0",
                "stat cluster.ops.final[0]=1.0",
                "end mycluster",
            ]
        );
    }

    #[test]
    fn errored_raw_stats_are_skipped() {
        let rec = recorder();
        let prev = new_prev_values();
        let mut pipeline = DerivedStatsPipeline::new(&[composite_spec()], &[], &[], &[], &prev);
        let results = vec![
            Stat::with_error("node.ops.in", 1, "stat unavailable"),
            Stat::new("node.ops.in", 2, 100, StatValue::Int(20)),
        ];
        pipeline.process("mycluster", results, &ProcessorAdapter::Streaming(Box::new(rec)));

        let events = rec.events();
        // the errored stat is neither forwarded nor selected: the composite
        // sums only node 2
        assert!(events.contains(&"stat cluster.node.ops.in.sum[0]=20".to_string()));
        assert!(!events.iter().any(|e| e.contains("node.ops.in[1]")));
    }

    #[test]
    fn errored_derived_stats_are_not_fed_forward() {
        let rec = recorder();
        let prev = new_prev_values();
        // composite selects nothing -> error stat -> equation never sees it
        let mut pipeline = DerivedStatsPipeline::new(
            &[composite_spec()],
            &[equation_spec("cluster.ops.double", "cluster.node.ops.in.sum * 2")],
            &[],
            &[],
            &prev,
        );
        pipeline.process(
            "mycluster",
            vec![Stat::new("node.other", 1, 100, StatValue::Int(1))],
            &ProcessorAdapter::Streaming(Box::new(rec)),
        );
        let events = rec.events();
        assert!(!events.iter().any(|e| e.contains("cluster.node.ops.in.sum")));
        assert!(!events.iter().any(|e| e.contains("cluster.ops.double")));
    }

    #[test]
    fn string_values_are_parsed_before_processing() {
        let rec = recorder();
        let prev = new_prev_values();
        let mut pipeline = DerivedStatsPipeline::new(&[], &[], &[], &[], &prev);
        pipeline.process(
            "mycluster",
            vec![Stat::new("node.cpu.count", 1, 100, StatValue::Str("8".into()))],
            &ProcessorAdapter::Streaming(Box::new(rec)),
        );
        assert!(rec.events().contains(&"stat node.cpu.count[1]=8".to_string()));
    }

    #[derive(Default)]
    struct BatchRecorder {
        batches: Mutex<Vec<(String, usize)>>,
    }

    impl BatchProcessor for &'static BatchRecorder {
        fn process(&self, cluster_name: &str, stats: &[Stat]) {
            self.batches.lock().push((cluster_name.to_string(), stats.len()));
        }
    }

    #[test]
    fn batch_processors_get_one_call_and_no_derived_stats() {
        let rec: &'static BatchRecorder = Box::leak(Box::new(BatchRecorder::default()));
        let prev = new_prev_values();
        let mut pipeline = DerivedStatsPipeline::new(&[composite_spec()], &[], &[], &[], &prev);
        let results = vec![
            Stat::new("node.ops.in", 1, 100, StatValue::Int(10)),
            Stat::new("node.ops.in", 2, 100, StatValue::Int(20)),
        ];
        pipeline.process("mycluster", results, &ProcessorAdapter::Batch(Box::new(rec)));
        assert_eq!(rec.batches.lock().clone(), vec![("mycluster".to_string(), 2)]);
    }
}
