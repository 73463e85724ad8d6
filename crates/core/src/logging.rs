//! Structured logging setup: `tracing` + `tracing-subscriber` wiring.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a global `tracing` subscriber. `default_directive` is used when
/// `RUST_LOG` is unset, e.g. `"tunneld=info,tunnel_quic=info"`.
pub fn init(default_directive: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
	let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.try_init();
}
