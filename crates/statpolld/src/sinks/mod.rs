//! Built-in stats processors.

mod influxdb;
mod stdout;

pub use influxdb::InfluxDbSink;
pub use stdout::StdoutSink;

use statpoll_core::processor::ProcessorAdapter;

/// Looks up a processor by its configured name. Returns `None` for unknown
/// names; the caller turns that into a configuration error.
pub fn create(name: &str) -> Option<ProcessorAdapter> {
    match name {
        "influxdb" => Some(ProcessorAdapter::Streaming(Box::new(InfluxDbSink::new()))),
        "stdout" => Some(ProcessorAdapter::Streaming(Box::new(StdoutSink::new()))),
        _ => None,
    }
}
