//! Downstream stats processors.
//!
//! A processor is the sink that raw and derived stats are forwarded to: a
//! time-series database writer, a metrics exposer, a debug printer. Two
//! shapes exist:
//!
//! - **streaming** ([`StreamingProcessor`]): one call per stat, bracketed by
//!   `begin_process`/`end_process` per cluster. Required for derived-stat
//!   support.
//! - **batch** ([`BatchProcessor`]): all of a cluster's raw stats in one
//!   call. Legacy shape; derived stats are not supported.
//!
//! Implementations are shared across the query fan-out's worker threads and
//! are responsible for their own interior mutability. The scheduler
//! guarantees that one cluster's `begin_process .. end_process` bracket is
//! never interleaved with itself, but stats for different clusters may
//! arrive concurrently.

use crate::stats::Stat;

/// Error starting a stats processor. Fatal at configuration time.
#[derive(Debug)]
pub enum ProcessorError {
    Start(String),
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::Start(msg) => write!(f, "failed to start stats processor: {}", msg),
        }
    }
}

impl std::error::Error for ProcessorError {}

/// A processor receiving stats one at a time.
///
/// `begin_process`, `end_process`, `start`, and `stop` default to no-ops so
/// implementations only define what they need.
pub trait StreamingProcessor: Send + Sync {
    /// Called once at configuration time, before the run loop starts.
    fn start(&self, _args: &[String]) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Called before the first stat of a cluster's result set.
    fn begin_process(&self, _cluster_name: &str) {}

    fn process_stat(&self, cluster_name: &str, stat: &Stat);

    /// Called after the last stat of a cluster's result set.
    fn end_process(&self, _cluster_name: &str) {}

    /// Called once at shutdown.
    fn stop(&self) {}
}

/// A processor receiving a cluster's raw stats all at once.
pub trait BatchProcessor: Send + Sync {
    fn start(&self, _args: &[String]) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn process(&self, cluster_name: &str, stats: &[Stat]);

    fn stop(&self) {}
}

/// Bridges the core to whichever processor shape was configured.
pub enum ProcessorAdapter {
    Streaming(Box<dyn StreamingProcessor>),
    Batch(Box<dyn BatchProcessor>),
}

impl ProcessorAdapter {
    /// Derived stats need the per-stat entry point.
    pub fn supports_derived_stats(&self) -> bool {
        matches!(self, ProcessorAdapter::Streaming(_))
    }

    pub fn start(&self, args: &[String]) -> Result<(), ProcessorError> {
        match self {
            ProcessorAdapter::Streaming(p) => p.start(args),
            ProcessorAdapter::Batch(p) => p.start(args),
        }
    }

    pub fn stop(&self) {
        match self {
            ProcessorAdapter::Streaming(p) => p.stop(),
            ProcessorAdapter::Batch(p) => p.stop(),
        }
    }

    pub fn begin_process(&self, cluster_name: &str) {
        if let ProcessorAdapter::Streaming(p) = self {
            p.begin_process(cluster_name);
        }
    }

    pub fn process_stat(&self, cluster_name: &str, stat: &Stat) {
        if let ProcessorAdapter::Streaming(p) = self {
            p.process_stat(cluster_name, stat);
        }
    }

    pub fn end_process(&self, cluster_name: &str) {
        if let ProcessorAdapter::Streaming(p) = self {
            p.end_process(cluster_name);
        }
    }

    pub fn process_batch(&self, cluster_name: &str, stats: &[Stat]) {
        if let ProcessorAdapter::Batch(p) = self {
            p.process(cluster_name, stats);
        }
    }
}
