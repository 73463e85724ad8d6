//! Process-wide metrics registry.
//!
//! This crate only registers metric families into a [`prometheus_client::registry::Registry`]
//! handed in by the caller; exposition (serving `/metrics`) is out of
//! scope.

use prometheus_client::registry::Registry;

pub use crate::tokio_collector::TokioCollector;

/// Registers the tokio runtime collector on the given registry, under the
/// current tokio runtime handle.
pub fn register_runtime_collector(registry: &mut Registry) {
	TokioCollector::register(registry, &tokio::runtime::Handle::current());
}
