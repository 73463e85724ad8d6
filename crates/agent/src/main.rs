//! `tunneld`: the process that wires the connection core up to a real
//! socket. Everything below the `OriginProxy` boundary — origin dialing,
//! ingress-rule matching, the outer supervisor's scale-up/down policy, and
//! edge-IP discovery — stays out of scope; this binary drives the core
//! against the loopback origin proxy so the core itself is exercised end
//! to end.

mod cli;
mod config;
mod supervisor;
mod tls;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::sync::watch;

use tunnel_observer::Observer;
use tunnel_origin::{AcceptingOrchestrator, LoopbackProxy, NullIcmpRouter};
use tunnel_transport::ProtocolSelector;

use crate::cli::Cli;
use crate::config::{load_credentials, TunnelConfig};
use crate::supervisor::SupervisorSlot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	tunnel_core::logging::init(&cli.log_level);
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let config = TunnelConfig::load(&cli.config)?;
	let credentials = load_credentials(&cli.credentials)?;

	let observer = Arc::new(Observer::new());
	let mut registry = Registry::default();
	observer.register_metrics(&mut registry);
	tunnel_core::metrics::register_runtime_collector(&mut registry);

	let selector = Arc::new(match cli.protocol.as_deref() {
		Some(name) => {
			let kind = tunnel_transport::TransportKind::parse(name).ok_or_else(|| anyhow::anyhow!("unknown protocol override: {name}"))?;
			ProtocolSelector::static_kind(kind)
		},
		None => ProtocolSelector::default_auto(),
	});

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(wait_for_signal(shutdown_tx));

	let grace_period = Duration::from_secs(cli.grace_period_secs);
	let mut handles = Vec::with_capacity(cli.connections as usize);
	for connection_index in 0..cli.connections {
		let slot = SupervisorSlot {
			connection_index,
			credentials: credentials.clone(),
			edge_hostname_override: config.edge_hostname.clone(),
			origin_base_url: config.origin_base_url.clone(),
			features: config.features.clone(),
			grace_period,
			origin: Arc::new(LoopbackProxy),
			orchestrator: Arc::new(AcceptingOrchestrator),
			icmp: Arc::new(NullIcmpRouter),
			observer: observer.clone(),
			selector: selector.clone(),
		};
		handles.push(tokio::spawn(supervisor::run(slot, shutdown_rx.clone())));
	}

	for handle in handles {
		let _ = handle.await;
	}

	Ok(())
}

/// Translates SIGINT/SIGTERM into the shutdown-channel close every
/// connection's control-stream handler already waits on.
async fn wait_for_signal(shutdown_tx: watch::Sender<bool>) {
	let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
		Ok(s) => s,
		Err(err) => {
			tracing::warn!(error = %err, "failed to install SIGTERM handler");
			return;
		},
	};

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {},
		_ = sigterm.recv() => {},
	}

	tracing::info!("shutdown signal received, unregistering connections");
	let _ = shutdown_tx.send(true);
}
