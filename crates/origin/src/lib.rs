//! Origin-proxy interface: the sole collaboration point
//! between the connection core and everything below it. Origin dialing,
//! ingress-rule matching, and the real HTTP/TCP client implementations are
//! out of scope; this crate only defines the trait
//! boundary plus a loopback test double exercised by this crate's own
//! tests and reused by `tunnel-h2`/`tunnel-quic` integration tests.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// One HTTP request as handed to the origin proxy, already decoded from
/// multiplex headers.
#[derive(Debug, Clone, Default)]
pub struct TracedRequest {
	pub method: String,
	pub url: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
	pub trace_id: Option<String>,
}

/// `ProxyTCP`'s request shape.
#[derive(Debug, Clone)]
pub struct TCPRequest {
	pub dest: String,
	pub cf_ray: String,
	pub lb_probe: bool,
	pub flow_id: Option<String>,
	pub trace_id: Option<String>,
	pub conn_index: u8,
}

/// The response side of `ProxyHTTP`: owned by the caller, must not be
/// written to after `proxy_http` returns.
#[async_trait]
pub trait ResponseSink: Send {
	async fn write_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()>;
	async fn write_body(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// Signals upstream acceptance before any bytes flow.
#[async_trait]
pub trait Acker: Send {
	async fn ack(&mut self, trace: Option<String>) -> anyhow::Result<()>;
}

/// The ack-able read/writer handed to `ProxyTCP`.
pub trait ReadWriteAcker: AsyncRead + AsyncWrite + Acker + Unpin + Send {}
impl<T> ReadWriteAcker for T where T: AsyncRead + AsyncWrite + Acker + Unpin + Send {}

/// Abstracts the downstream proxy: HTTP/WS and TCP. Errors
/// propagate up as opaque; the core classifies only the rate-limit
/// sentinel via `is_too_many_active_flows`.
#[async_trait]
pub trait OriginProxy: Send + Sync {
	/// Websocket upgrade is indicated by `is_websocket`, not by inspecting
	/// headers.
	async fn proxy_http(&self, sink: &mut dyn ResponseSink, request: TracedRequest, is_websocket: bool) -> anyhow::Result<()>;

	async fn proxy_tcp(&self, stream: Pin<Box<dyn ReadWriteAcker>>, request: TCPRequest) -> anyhow::Result<()>;
}

/// Sentinel error recognized by `tunnel-quic`'s flow-rate-limited path.
#[derive(Debug, thiserror::Error)]
#[error("too many active flows")]
pub struct TooManyActiveFlows;

pub fn is_too_many_active_flows(err: &anyhow::Error) -> bool {
	err.downcast_ref::<TooManyActiveFlows>().is_some()
}

/// The local ICMP forwarding implementation the QUIC connection's
/// packet-router task hands decoded datagrams to.
/// Raw ICMP sockets are a privileged, platform-specific concern external
/// to the connection core, same as origin dialing; this trait is the
/// boundary. `route` is handed one decoded ICMP packet from the edge and
/// returns any reply packets to send back over the datagram channel.
#[async_trait]
pub trait IcmpRouter: Send + Sync {
	async fn route(&self, packet: Vec<u8>) -> anyhow::Result<Vec<Vec<u8>>>;
}

/// No-op router used when the agent is not configured to proxy ICMP; logs
/// and drops every packet instead of failing the connection.
pub struct NullIcmpRouter;

#[async_trait]
impl IcmpRouter for NullIcmpRouter {
	async fn route(&self, packet: Vec<u8>) -> anyhow::Result<Vec<Vec<u8>>> {
		tracing::debug!(len = packet.len(), "icmp routing not configured, dropping packet");
		Ok(Vec::new())
	}
}

/// Outcome of one `update_configuration` push, mirrored onto the wire as
/// `{lastAppliedVersion, err}`.
#[derive(Debug, Clone)]
pub struct ConfigUpdateOutcome {
	pub last_applied_version: i32,
	pub err: Option<String>,
}

/// The local ingress-rule orchestrator a `ConfigurationUpdate` stream hands
/// its decoded body to. Rule matching and reload itself are out of scope
/// for the connection core (spec Non-goals); this trait is the boundary.
#[async_trait]
pub trait Orchestrator: Send + Sync {
	async fn update_config(&self, version: i32, config: serde_json::Value) -> ConfigUpdateOutcome;
}

/// Accepts every pushed configuration unconditionally; used by the thin
/// binary crate and by tests that don't exercise real ingress reloading.
pub struct AcceptingOrchestrator;

#[async_trait]
impl Orchestrator for AcceptingOrchestrator {
	async fn update_config(&self, version: i32, _config: serde_json::Value) -> ConfigUpdateOutcome {
		ConfigUpdateOutcome { last_applied_version: version, err: None }
	}
}

/// A trivial origin proxy used by integration tests: HTTP requests get a
/// canned 200, TCP connections are echoed back byte for byte.
pub struct LoopbackProxy;

#[async_trait]
impl OriginProxy for LoopbackProxy {
	async fn proxy_http(&self, sink: &mut dyn ResponseSink, request: TracedRequest, _is_websocket: bool) -> anyhow::Result<()> {
		sink.write_headers(200, vec![("content-type".to_string(), "text/plain".to_string())]).await?;
		sink.write_body(&request.body).await?;
		Ok(())
	}

	async fn proxy_tcp(&self, mut stream: Pin<Box<dyn ReadWriteAcker>>, _request: TCPRequest) -> anyhow::Result<()> {
		use tokio::io::{AsyncReadExt, AsyncWriteExt};
		stream.ack(None).await?;
		let mut buf = [0u8; 4096];
		loop {
			let n = stream.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			stream.write_all(&buf[..n]).await?;
		}
		Ok(())
	}
}
