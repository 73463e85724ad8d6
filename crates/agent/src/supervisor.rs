//! Drives one connection slot: resolve the edge, dial the selected
//! transport, register, serve until the edge closes the connection or
//! `shutdown` fires, then redial with backoff. The real supervisor's
//! scale-up/down policy and edge-IP discovery stay out of scope; this is
//! the thin stand-in the process needs to exercise the core end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

use tunnel_core::error::ConnectionError;
use tunnel_core::{BuildInfo, ConnectionOptions, Credentials};
use tunnel_observer::Observer;
use tunnel_origin::{IcmpRouter, Orchestrator, OriginProxy};
use tunnel_transport::{ProtocolSelector, TransportKind};

use crate::tls;

/// The TCP/UDP port both transports listen on at the edge.
const EDGE_PORT: u16 = 7844;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct SupervisorSlot {
	pub connection_index: u8,
	pub credentials: Credentials,
	pub edge_hostname_override: Option<String>,
	pub origin_base_url: String,
	pub features: Vec<String>,
	pub grace_period: Duration,
	pub origin: Arc<dyn OriginProxy>,
	pub orchestrator: Arc<dyn Orchestrator>,
	pub icmp: Arc<dyn IcmpRouter>,
	pub observer: Arc<Observer>,
	pub selector: Arc<ProtocolSelector>,
}

/// Redials forever, backing off between failed attempts, until `shutdown`
/// is set. Returns once the slot has shut down cleanly.
pub async fn run(slot: SupervisorSlot, mut shutdown: watch::Receiver<bool>) {
	let mut backoff = MIN_BACKOFF;
	let mut attempts: u32 = 0;

	while !*shutdown.borrow() {
		let kind = slot.selector.current().await;
		let span = tracing::info_span!("connection", index = slot.connection_index, protocol = kind.name());
		let _enter = span.enter();

		let result = dial_and_serve(&slot, kind, attempts, shutdown.clone()).await;
		drop(_enter);

		match result {
			Ok(()) => {
				tracing::info!(index = slot.connection_index, "connection closed cleanly");
				backoff = MIN_BACKOFF;
				attempts = 0;
			},
			Err(err) => {
				tracing::warn!(index = slot.connection_index, error = %err, "connection attempt failed");
				if err.suggests_fallback() {
					let (fallback, has_fallback) = slot.selector.fallback();
					if has_fallback {
						tracing::info!(index = slot.connection_index, fallback = fallback.name(), "falling back to next transport");
					}
				}
				attempts += 1;
			},
		}

		if *shutdown.borrow() {
			break;
		}

		tokio::select! {
			_ = tokio::time::sleep(backoff) => {},
			_ = shutdown.changed() => break,
		}
		backoff = (backoff * 2).min(MAX_BACKOFF);
	}
}

async fn dial_and_serve(slot: &SupervisorSlot, kind: TransportKind, num_previous_attempts: u32, shutdown: watch::Receiver<bool>) -> Result<(), ConnectionError> {
	let hostname = slot.edge_hostname_override.as_deref().unwrap_or_else(|| kind.sni());
	let addr = resolve(hostname).await?;

	let mut options = ConnectionOptions::new(BuildInfo::current(), slot.connection_index);
	options.features = slot.features.clone();
	options.num_previous_attempts = Some(num_previous_attempts);

	match kind {
		TransportKind::Quic => {
			let client_config = tls::quic_client_config().map_err(ConnectionError::DialEdge)?;
			let conn = tunnel_quic::dial(addr, hostname, client_config, slot.connection_index).await?;
			let core = tunnel_quic::Connection::new(
				conn,
				slot.origin.clone(),
				slot.orchestrator.clone(),
				slot.icmp.clone(),
				slot.observer.clone(),
				slot.connection_index,
				slot.origin_base_url.clone(),
			);
			core.serve(slot.credentials.clone(), options, addr.ip(), slot.grace_period, shutdown).await
		},
		TransportKind::Http2 => {
			let tcp = TcpStream::connect(addr).await.map_err(|e| ConnectionError::DialEdge(e.into()))?;
			let tls_config = tls::h2_client_config().map_err(ConnectionError::DialEdge)?;
			let server_name = tls::server_name(hostname).map_err(ConnectionError::DialEdge)?;
			let connector = TlsConnector::from(Arc::new(tls_config));
			let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| ConnectionError::Handshake(e.into()))?;
			let core = tunnel_h2::Connection::handshake(
				tls_stream,
				slot.origin.clone(),
				slot.orchestrator.clone(),
				slot.observer.clone(),
				slot.connection_index,
				slot.origin_base_url.clone(),
			)
			.await?;
			core.serve(slot.credentials.clone(), options, addr.ip(), slot.grace_period, shutdown).await
		},
	}
}

async fn resolve(hostname: &str) -> Result<SocketAddr, ConnectionError> {
	tokio::net::lookup_host((hostname, EDGE_PORT))
		.await
		.map_err(|e| ConnectionError::DialEdge(e.into()))?
		.next()
		.ok_or_else(|| ConnectionError::DialEdge(anyhow::anyhow!("no addresses for {hostname}")))
}
