//! Debug sink that prints every stat to stdout.

use chrono::DateTime;
use statpoll_core::processor::StreamingProcessor;
use statpoll_core::stats::Stat;
use tracing::debug;

pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        StdoutSink
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        StdoutSink::new()
    }
}

impl StreamingProcessor for StdoutSink {
    fn begin_process(&self, cluster_name: &str) {
        debug!("begin processing stats for {}", cluster_name);
    }

    fn process_stat(&self, cluster_name: &str, stat: &Stat) {
        let timestamp = DateTime::from_timestamp(stat.time, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| stat.time.to_string());
        println!(
            "{} {} {}[{}] = {}",
            timestamp, cluster_name, stat.key, stat.devid, stat.value
        );
    }

    fn end_process(&self, cluster_name: &str) {
        debug!("done processing stats for {}", cluster_name);
    }
}
