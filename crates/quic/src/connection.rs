//! The QUIC connection: five concurrent tasks sharing one
//! `quinn::Connection` — the control stream, the accept-stream loop for
//! edge-initiated proxy streams, the session-manager's idle-sweep loop,
//! the datagram receive loop, and the packet-router task that multiplexes
//! UDP-session replies and ICMP forwarding back out over the unreliable
//! datagram channel.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use tunnel_control::ControlStream;
use tunnel_core::error::ConnectionError;
use tunnel_core::{ActivityBarrier, ConnectionOptions, Credentials};
use tunnel_observer::Observer;
use tunnel_origin::{is_too_many_active_flows, IcmpRouter, Orchestrator, OriginProxy, TCPRequest, TracedRequest};
use tunnel_transport::{RequestKind, TransportKind};
use tunnel_wire::header_codec;
use tunnel_wire::{HeaderSink, ResponseWriter, SharedAck};

use crate::datagram::{self, SessionManager};
use crate::stream_io::{self, AckableStream};
use crate::wire::{self, ConnectRequest, ConnectResponseData, StreamDuplex, UdpSessionRequest, UdpSessionResponse, UnregisterUdpSession, WireRequestKind};

/// Flows share one budget across UDP sessions and proxied TCP streams.
const MAX_ACTIVE_FLOWS: usize = 512;

/// How often the session-manager task sweeps for sessions whose idle
/// timer already expired between datagrams.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Connection {
	conn: quinn::Connection,
	origin: Arc<dyn OriginProxy>,
	orchestrator: Arc<dyn Orchestrator>,
	icmp: Arc<dyn IcmpRouter>,
	observer: Arc<Observer>,
	connection_index: u8,
	origin_base_url: String,
}

/// Which of the five per-connection tasks exited, and how.
enum TaskExit {
	Control(Result<(), ConnectionError>),
	Accept(anyhow::Error),
	SessionManager(anyhow::Error),
	DatagramRecv(anyhow::Error),
	PacketRouter(anyhow::Error),
}

impl Connection {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		conn: quinn::Connection,
		origin: Arc<dyn OriginProxy>,
		orchestrator: Arc<dyn Orchestrator>,
		icmp: Arc<dyn IcmpRouter>,
		observer: Arc<Observer>,
		connection_index: u8,
		origin_base_url: String,
	) -> Self {
		Connection { conn, origin, orchestrator, icmp, observer, connection_index, origin_base_url }
	}

	pub async fn serve(
		self,
		credentials: Credentials,
		options: ConnectionOptions,
		edge_ip: IpAddr,
		grace_period: Duration,
		shutdown: watch::Receiver<bool>,
	) -> Result<(), ConnectionError> {
		let (mut control, control_state) = self.open_control_stream().await?;
		control.register(&credentials, options, TransportKind::Quic, edge_ip).await?;

		let (datagram_tx, datagram_rx) = mpsc::channel::<Bytes>(256);
		let (icmp_tx, icmp_rx) = mpsc::channel::<Vec<u8>>(64);
		let session_manager = Arc::new(SessionManager::new(MAX_ACTIVE_FLOWS, datagram_tx.clone(), self.conn.clone()));
		let activity = Arc::new(ActivityBarrier::new());

		let (exit_tx, mut exit_rx) = mpsc::channel::<TaskExit>(5);

		let handles = vec![
			spawn_control_task(exit_tx.clone(), control, grace_period, shutdown.clone()),
			spawn_accept_task(
				exit_tx.clone(),
				self.conn.clone(),
				self.origin.clone(),
				self.orchestrator.clone(),
				self.origin_base_url.clone(),
				self.connection_index,
				session_manager.clone(),
				control_state.clone(),
				activity.clone(),
				shutdown.clone(),
			),
			spawn_session_manager_task(exit_tx.clone(), session_manager.clone(), shutdown.clone()),
			spawn_datagram_recv_task(exit_tx.clone(), self.conn.clone(), session_manager.clone(), icmp_tx, shutdown.clone()),
			spawn_packet_router_task(exit_tx.clone(), self.conn.clone(), self.icmp.clone(), datagram_rx, icmp_rx, shutdown.clone()),
		];
		drop(exit_tx);

		// Join-any-returns-cancel-all: the
		// first task to exit determines the outcome; the remaining four are
		// aborted explicitly, since a bare `tokio::spawn` keeps running
		// independently of `serve`'s own scope otherwise.
		let first_exit = exit_rx.recv().await;
		for handle in &handles {
			handle.abort();
		}
		activity.wait_idle().await;

		match first_exit {
			Some(TaskExit::Control(Ok(()))) => Ok(()),
			Some(TaskExit::Control(Err(e))) => Err(e),
			Some(TaskExit::Accept(e)) => Err(ConnectionError::StreamListener(e)),
			Some(TaskExit::SessionManager(e)) => Err(ConnectionError::DatagramManager(e)),
			Some(TaskExit::DatagramRecv(e)) => Err(ConnectionError::DatagramManager(e)),
			Some(TaskExit::PacketRouter(e)) => Err(ConnectionError::DatagramManager(e)),
			None => Err(ConnectionError::EdgeConnectionClosed),
		}
	}

	/// Opens the agent-initiated control stream (unlike the H2 connection,
	/// where the edge always initiates, QUIC's symmetric stream model lets
	/// the agent open this one itself — this is an assumption the edge
	/// makes about the first stream, not a negotiation).
	async fn open_control_stream(&self) -> Result<(ControlStream<StreamDuplex>, Arc<tunnel_control::ControlState>), ConnectionError> {
		let (send, recv) = self.conn.open_bi().await.map_err(|e| ConnectionError::ControlStream(e.into()))?;
		let mut duplex = StreamDuplex::new(send, recv);

		wire::write_message(&mut duplex, &ConnectRequest { kind: WireRequestKind::ControlStream, headers: Vec::new() })
			.await
			.map_err(ConnectionError::ControlStream)?;
		let _ack: ConnectResponseData = wire::read_message(&mut duplex).await.map_err(ConnectionError::ControlStream)?;

		let (control, control_state, _connected_rx) = ControlStream::new(duplex, self.observer.clone(), self.connection_index);
		Ok((control, control_state))
	}
}

fn spawn_control_task(exit: mpsc::Sender<TaskExit>, mut control: ControlStream<StreamDuplex>, grace_period: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let _ = shutdown.changed().await;
		control.begin_unregister(grace_period).await;
		let result = if control.is_stopped() { Ok(()) } else { Err(ConnectionError::EdgeConnectionClosed) };
		let _ = exit.send(TaskExit::Control(result)).await;
	})
}

#[allow(clippy::too_many_arguments)]
fn spawn_accept_task(
	exit: mpsc::Sender<TaskExit>,
	conn: quinn::Connection,
	origin: Arc<dyn OriginProxy>,
	orchestrator: Arc<dyn Orchestrator>,
	origin_base_url: String,
	connection_index: u8,
	session_manager: Arc<SessionManager>,
	control_state: Arc<tunnel_control::ControlState>,
	activity: Arc<ActivityBarrier>,
	mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				accepted = conn.accept_bi() => {
					match accepted {
						Ok((send, recv)) => {
							if control_state.is_stopped() {
								continue;
							}
							let origin = origin.clone();
							let orchestrator = orchestrator.clone();
							let origin_base_url = origin_base_url.clone();
							let session_manager = session_manager.clone();
							let guard = ActivityBarrier::enter(&activity);
							tokio::spawn(async move {
								let _guard = guard;
								if let Err(err) = dispatch_stream(send, recv, origin, orchestrator, &origin_base_url, connection_index, session_manager).await {
									tracing::warn!(error = %err, "quic stream dispatch failed");
								}
							});
						},
						Err(e) => {
							if !control_state.is_stopped() {
								let _ = exit.send(TaskExit::Accept(e.into())).await;
							}
							return;
						},
					}
				},
				_ = shutdown.changed() => return,
			}
		}
	})
}

/// The sweep itself never fails today; `_exit` is kept so a future
/// fatal-sweep condition has somewhere to report without changing every
/// caller's signature.
fn spawn_session_manager_task(_exit: mpsc::Sender<TaskExit>, session_manager: Arc<SessionManager>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = tokio::time::sleep(SESSION_SWEEP_INTERVAL) => {
					tracing::trace!(active = session_manager.active_count(), "udp session sweep");
				},
				_ = shutdown.changed() => return,
			}
		}
	})
}

fn spawn_datagram_recv_task(exit: mpsc::Sender<TaskExit>, conn: quinn::Connection, session_manager: Arc<SessionManager>, icmp_tx: mpsc::Sender<Vec<u8>>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				datagram = conn.read_datagram() => {
					match datagram {
						Ok(datagram) => match datagram::decode_datagram(datagram) {
							Some((datagram::DatagramKind::Session(id), payload)) => session_manager.route_inbound(id, payload),
							Some((datagram::DatagramKind::Icmp, payload)) => {
								let _ = icmp_tx.send(payload.to_vec()).await;
							},
							None => tracing::warn!("dropped malformed datagram"),
						},
						Err(e) => {
							let _ = exit.send(TaskExit::DatagramRecv(e.into())).await;
							return;
						},
					}
				},
				_ = shutdown.changed() => return,
			}
		}
	})
}

fn spawn_packet_router_task(
	exit: mpsc::Sender<TaskExit>,
	conn: quinn::Connection,
	icmp: Arc<dyn IcmpRouter>,
	mut datagram_rx: mpsc::Receiver<Bytes>,
	mut icmp_rx: mpsc::Receiver<Vec<u8>>,
	mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				Some(payload) = datagram_rx.recv() => {
					if conn.send_datagram(payload).is_err() {
						let _ = exit.send(TaskExit::PacketRouter(anyhow::anyhow!("datagram send failed, connection likely closed"))).await;
						return;
					}
				},
				Some(packet) = icmp_rx.recv() => {
					match icmp.route(packet).await {
						Ok(replies) => {
							for reply in replies {
								let framed = datagram::encode_datagram(datagram::DatagramKind::Icmp, &reply);
								if conn.send_datagram(framed).is_err() {
									return;
								}
							}
						},
						Err(e) => tracing::warn!(error = %e, "icmp routing failed"),
					}
				},
				_ = shutdown.changed() => return,
				else => return,
			}
		}
	})
}

async fn dispatch_stream(
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	origin: Arc<dyn OriginProxy>,
	orchestrator: Arc<dyn Orchestrator>,
	origin_base_url: &str,
	connection_index: u8,
	session_manager: Arc<SessionManager>,
) -> anyhow::Result<()> {
	let mut duplex = StreamDuplex::new(send, recv);
	let request: ConnectRequest = wire::read_message(&mut duplex).await?;

	match request.kind {
		WireRequestKind::ControlStream => anyhow::bail!("second control stream on one connection"),
		WireRequestKind::UdpSession => handle_udp_session(duplex, session_manager).await,
		WireRequestKind::UnregisterUdpSession => {
			let call: UnregisterUdpSession = wire::read_message(&mut duplex).await?;
			session_manager.unregister(call.session_id);
			wire::write_message(&mut duplex, &UdpSessionResponse { accepted: true }).await
		},
		WireRequestKind::ConfigurationUpdate => {
			let update: wire::ConfigUpdateRequest = wire::read_message(&mut duplex).await?;
			let config: serde_json::Value = serde_json::from_slice(&update.config_json)?;
			let outcome = orchestrator.update_config(update.version, config).await;
			wire::write_message(
				&mut duplex,
				&wire::ConfigUpdateResponse { last_applied_version: outcome.last_applied_version, err: outcome.err },
			)
			.await
		},
		kind @ (WireRequestKind::Http | WireRequestKind::WebSocket | WireRequestKind::Tcp) => {
			let request_kind = RequestKind::try_from(kind).expect("checked above");
			dispatch_proxied_stream(duplex, request.headers, request_kind, origin, origin_base_url, connection_index).await
		},
	}
}

async fn handle_udp_session(mut duplex: StreamDuplex, session_manager: Arc<SessionManager>) -> anyhow::Result<()> {
	let session_request: UdpSessionRequest = wire::read_message(&mut duplex).await?;
	let dest: std::net::SocketAddr = session_request
		.dest
		.parse()
		.map_err(|_| anyhow::anyhow!("invalid udp session destination {:?}", session_request.dest))?;

	match session_manager
		.register(session_request.session_id, dest, Duration::from_secs(session_request.close_after_idle_secs))
		.await
	{
		Ok(()) => wire::write_message(&mut duplex, &UdpSessionResponse { accepted: true }).await,
		Err(err) => {
			tracing::warn!(session_id = %session_request.session_id, error = %err, "udp session registration failed");
			wire::write_message(&mut duplex, &UdpSessionResponse { accepted: false }).await
		},
	}
}

async fn dispatch_proxied_stream(
	duplex: StreamDuplex,
	headers: Vec<(String, String)>,
	kind: RequestKind,
	origin: Arc<dyn OriginProxy>,
	origin_base_url: &str,
	connection_index: u8,
) -> anyhow::Result<()> {
	let decoded = header_codec::decode_request(&headers, origin_base_url)?;
	let (send, recv) = duplex.into_parts();
	let (io, header_sink) = stream_io::stream_io_pair(send, recv);

	match kind {
		RequestKind::Tcp => {
			let dest = decoded.host.clone().filter(|h| !h.is_empty());
			let Some(dest) = dest else {
				let mut header_sink = header_sink;
				header_sink.send_headers(502, vec![("cf-cloudflared-response-meta".to_string(), header_codec::ResponseSource::Cloudflared.meta_header_value())]).await?;
				anyhow::bail!("tcp stream with empty destination host");
			};
			let shared_sink = SharedAck::new(header_sink);
			let tcp_stream = AckableStream::new(io, shared_sink.clone());
			let request = TCPRequest {
				dest,
				cf_ray: decoded.headers.iter().find(|(k, _)| k == "cf-ray").map(|(_, v)| v.clone()).unwrap_or_default(),
				lb_probe: decoded.headers.iter().any(|(k, _)| k == "cf-lb-probe"),
				flow_id: decoded.headers.iter().find(|(k, _)| k == "flowid").map(|(_, v)| v.clone()),
				trace_id: None,
				conn_index: connection_index,
			};
			let result = origin.proxy_tcp(Box::pin(tcp_stream), request).await;
			if let Err(err) = &result {
				send_error_response(&shared_sink, err).await;
			}
			result
		},
		RequestKind::Http | RequestKind::WebSocket => {
			use tokio::io::AsyncReadExt;
			let mut io = io;
			let mut body_buf = Vec::new();
			io.read_to_end(&mut body_buf).await?;

			let mut writer = ResponseWriter::new(header_sink, io, kind);
			let traced = TracedRequest {
				method: decoded.method.clone().unwrap_or_default(),
				url: decoded.url.clone(),
				headers: decoded.headers.clone(),
				body: body_buf,
				trace_id: None,
			};
			let is_websocket = matches!(kind, RequestKind::WebSocket);
			let result = {
				let mut sink = QuicResponseSink { inner: &mut writer };
				origin.proxy_http(&mut sink, traced, is_websocket).await
			};
			if let Err(err) = &result {
				let _ = writer.write_error_response(is_too_many_active_flows(err)).await;
			}
			result
		},
		RequestKind::ControlStream | RequestKind::ConfigurationUpdate => unreachable!("filtered by caller"),
	}
}

/// Sends the `502 Bad Gateway` + `cf-cloudflared-response-meta` translation
/// of an `OriginProxyError` if nothing was acked on this stream yet; a
/// no-op if `ack()` already ran.
async fn send_error_response(shared_sink: &SharedAck<stream_io::QuicHeaderSink>, err: &anyhow::Error) {
	let source = if is_too_many_active_flows(err) {
		header_codec::ResponseSource::FlowRateLimited
	} else {
		header_codec::ResponseSource::Cloudflared
	};
	let headers = vec![("cf-cloudflared-response-meta".to_string(), source.meta_header_value())];
	if let Err(send_err) = shared_sink.send_if_unused(502, headers).await {
		tracing::warn!(error = %send_err, "failed to send tcp error response");
	}
}

struct QuicResponseSink<'a> {
	inner: &'a mut ResponseWriter<stream_io::QuicHeaderSink, stream_io::QuicStreamIo>,
}

#[async_trait::async_trait]
impl<'a> tunnel_origin::ResponseSink for QuicResponseSink<'a> {
	async fn write_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
		self.inner.write_headers(status, headers).await
	}

	async fn write_body(&mut self, data: &[u8]) -> anyhow::Result<()> {
		self.inner.write(data).await.map_err(Into::into)
	}
}
