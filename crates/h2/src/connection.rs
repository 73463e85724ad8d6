//! The HTTP/2-framed connection: owns one h2 server connection
//! dialed to the edge, drives the control stream's registration and
//! graceful shutdown, and dispatches every other accepted stream to the
//! origin proxy according to [`dispatch::classify_request`].

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::watch;

use tunnel_control::ControlStream;
use tunnel_core::error::ConnectionError;
use tunnel_core::{ActivityBarrier, ConnectionOptions, Credentials};
use tunnel_observer::Observer;
use tunnel_origin::{is_too_many_active_flows, Acker, Orchestrator, OriginProxy, TCPRequest, TracedRequest};
use tunnel_transport::{RequestKind, TransportKind};
use tunnel_wire::header_codec;
use tunnel_wire::{ConfigUpdateRequest, ConfigUpdateResponse, HeaderSink, ResponseWriter, SharedAck};

use crate::dispatch::{self, PROXY_CONNECTION_UPGRADE};
use crate::stream_io::{self, H2HeaderSink, H2StreamIo};

/// How long `serve()` waits for the next stream (or for the first, control,
/// stream) before treating the edge as gone.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub struct Connection<T> {
	conn: h2::server::Connection<T, Bytes>,
	origin: Arc<dyn OriginProxy>,
	orchestrator: Arc<dyn Orchestrator>,
	observer: Arc<Observer>,
	connection_index: u8,
	origin_base_url: String,
	idle_timeout: Duration,
}

impl<T> Connection<T>
where
	T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	pub async fn handshake(
		io: T,
		origin: Arc<dyn OriginProxy>,
		orchestrator: Arc<dyn Orchestrator>,
		observer: Arc<Observer>,
		connection_index: u8,
		origin_base_url: String,
	) -> Result<Self, ConnectionError> {
		let conn = h2::server::handshake(io).await.map_err(|e| ConnectionError::Handshake(e.into()))?;
		Ok(Connection {
			conn,
			origin,
			orchestrator,
			observer,
			connection_index,
			origin_base_url,
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
		})
	}

	async fn accept_stream(&mut self) -> Result<Option<(http::Request<h2::RecvStream>, h2::server::SendResponse<Bytes>)>, ConnectionError> {
		match tokio::time::timeout(self.idle_timeout, self.conn.accept()).await {
			Ok(Some(Ok(pair))) => Ok(Some(pair)),
			Ok(Some(Err(e))) => Err(ConnectionError::StreamListener(e.into())),
			Ok(None) => Ok(None),
			Err(_) => Ok(None),
		}
	}

	/// Registers over the first accepted stream (which must be a control
	/// stream), then dispatches every subsequent stream until the edge
	/// closes the transport or `shutdown` fires. Mirrors the QUIC
	/// connection's close semantics: clean shutdown after the control
	/// stream reaches `Done` is success, anything else is
	/// [`ConnectionError::EdgeConnectionClosed`].
	pub async fn serve(
		mut self,
		credentials: Credentials,
		options: ConnectionOptions,
		edge_ip: IpAddr,
		grace_period: Duration,
		mut shutdown: watch::Receiver<bool>,
	) -> Result<(), ConnectionError> {
		let (request, respond) = self
			.accept_stream()
			.await?
			.ok_or(ConnectionError::EdgeConnectionClosed)?;
		if dispatch::classify_request(request.headers()) != RequestKind::ControlStream {
			return Err(ConnectionError::ControlStream(anyhow::anyhow!("first stream was not a control stream")));
		}

		let (control_io, mut header_sink) = stream_io::stream_io_pair(request.into_body(), respond);
		header_sink.send_headers(200, Vec::new()).await.map_err(ConnectionError::ControlStream)?;

		let (mut control, control_state, _connected_rx) = ControlStream::new(control_io, self.observer.clone(), self.connection_index);
		control.register(&credentials, options, TransportKind::Http2, edge_ip).await?;

		let activity = Arc::new(ActivityBarrier::new());

		let control_task = {
			let mut shutdown = shutdown.clone();
			tokio::spawn(async move {
				let _ = shutdown.changed().await;
				control.begin_unregister(grace_period).await;
			})
		};

		loop {
			if *shutdown.borrow() {
				break;
			}
			tokio::select! {
				accepted = self.accept_stream() => {
					match accepted? {
						Some((request, respond)) => {
							if control_state.is_stopped() {
								continue;
							}
							let origin = self.origin.clone();
							let orchestrator = self.orchestrator.clone();
							let origin_base_url = self.origin_base_url.clone();
							let guard = ActivityBarrier::enter(&activity);
							tokio::spawn(async move {
								let _guard = guard;
								if let Err(err) = dispatch_stream(request, respond, origin, orchestrator, &origin_base_url).await {
									tracing::warn!(error = %err, "stream dispatch failed");
								}
							});
						},
						None => break,
					}
				},
				_ = shutdown.changed() => break,
			}
		}

		// Only wait on the control task if `shutdown` is what broke the
		// loop: otherwise it's parked on `shutdown.changed()` forever since
		// the sender (the supervisor) is still alive, and the edge closing
		// the transport first must not hang `serve()`.
		if *shutdown.borrow() {
			let _ = control_task.await;
		} else {
			control_task.abort();
		}
		activity.wait_idle().await;
		if control_state.is_stopped() {
			Ok(())
		} else {
			Err(ConnectionError::EdgeConnectionClosed)
		}
	}
}

async fn dispatch_stream(
	request: http::Request<h2::RecvStream>,
	respond: h2::server::SendResponse<Bytes>,
	origin: Arc<dyn OriginProxy>,
	orchestrator: Arc<dyn Orchestrator>,
	origin_base_url: &str,
) -> anyhow::Result<()> {
	let kind = dispatch::classify_request(request.headers());
	let (parts, body) = request.into_parts();
	let mux_headers = dispatch::to_mux_headers(&parts.method, &parts.uri, &parts.headers);
	let decoded = header_codec::decode_request(&mux_headers, origin_base_url)?;
	let (mut io, header_sink) = stream_io::stream_io_pair(body, respond);

	match kind {
		RequestKind::ControlStream => anyhow::bail!("second control stream on one connection"),
		RequestKind::ConfigurationUpdate => {
			let mut body_buf = Vec::new();
			io.read_to_end(&mut body_buf).await?;
			let update: ConfigUpdateRequest = serde_json::from_slice(&body_buf)?;
			let outcome = orchestrator.update_config(update.version, update.config).await;
			let response = ConfigUpdateResponse { last_applied_version: outcome.last_applied_version, err: outcome.err };
			let mut writer = ResponseWriter::new(header_sink, io, kind);
			writer.write_headers(200, vec![("content-type".to_string(), "application/json".to_string())]).await?;
			writer.write(&serde_json::to_vec(&response)?).await?;
			Ok(())
		},
		RequestKind::Tcp => {
			let dest = decoded.host.clone().filter(|h| !h.is_empty());
			let Some(dest) = dest else {
				let mut header_sink = header_sink;
				header_sink.send_headers(502, vec![("cf-cloudflared-response-meta".to_string(), header_codec::ResponseSource::Cloudflared.meta_header_value())]).await?;
				anyhow::bail!("tcp stream with empty destination host");
			};
			let shared_sink = SharedAck::new(header_sink);
			let tcp_stream = H2TcpStream::new(io, shared_sink.clone());
			let request = TCPRequest {
				dest,
				cf_ray: find_header(&decoded.headers, "cf-ray").unwrap_or_default(),
				lb_probe: decoded.headers.iter().any(|(k, _)| k == "cf-lb-probe"),
				flow_id: find_header(&decoded.headers, "cf-cloudflared-proxy-src"),
				trace_id: None,
				conn_index: 0,
			};
			let result = origin.proxy_tcp(Box::pin(tcp_stream), request).await;
			if let Err(err) = &result {
				send_error_response(&shared_sink, err).await;
			}
			result
		},
		RequestKind::Http | RequestKind::WebSocket => {
			let mut body_buf = Vec::new();
			io.read_to_end(&mut body_buf).await?;

			let mut headers = decoded.headers.clone();
			headers.retain(|(k, _)| k != PROXY_CONNECTION_UPGRADE);

			let mut writer = ResponseWriter::new(header_sink, io, kind);
			let traced = TracedRequest {
				method: decoded.method.clone().unwrap_or_default(),
				url: decoded.url.clone(),
				headers: headers.clone(),
				body: body_buf,
				trace_id: find_header(&headers, "cf-ray"),
			};
			let is_websocket = matches!(kind, RequestKind::WebSocket);
			let result = {
				let mut sink = ResponseWriterSink { inner: &mut writer };
				origin.proxy_http(&mut sink, traced, is_websocket).await
			};
			if let Err(err) = &result {
				let _ = writer.write_error_response(is_too_many_active_flows(err)).await;
			}
			result
		},
	}
}

/// Sends the `502 Bad Gateway` + `cf-cloudflared-response-meta` translation
/// of an `OriginProxyError` if nothing was acked on this stream yet; a
/// no-op if `ack()` already ran.
async fn send_error_response(shared_sink: &SharedAck<H2HeaderSink>, err: &anyhow::Error) {
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

fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
	headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
}

struct ResponseWriterSink<'a> {
	inner: &'a mut ResponseWriter<H2HeaderSink, H2StreamIo>,
}

#[async_trait]
impl<'a> tunnel_origin::ResponseSink for ResponseWriterSink<'a> {
	async fn write_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
		self.inner.write_headers(status, headers).await
	}

	async fn write_body(&mut self, data: &[u8]) -> anyhow::Result<()> {
		self.inner.write(data).await.map_err(Into::into)
	}
}

/// A TCP-dispatched h2 stream: reading/writing go straight through to the
/// stream body, and `ack()` sends the 200 response headers that tell the
/// edge the origin accepted the connection.
struct H2TcpStream {
	io: H2StreamIo,
	header_sink: SharedAck<H2HeaderSink>,
}

impl H2TcpStream {
	fn new(io: H2StreamIo, header_sink: SharedAck<H2HeaderSink>) -> Self {
		H2TcpStream { io, header_sink }
	}
}

#[async_trait]
impl Acker for H2TcpStream {
	async fn ack(&mut self, _trace: Option<String>) -> anyhow::Result<()> {
		self.header_sink.send_if_unused(200, Vec::new()).await?;
		Ok(())
	}
}

impl AsyncRead for H2TcpStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.io).poll_read(cx, buf)
	}
}

impl AsyncWrite for H2TcpStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.io).poll_write(cx, buf)
	}
	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.io).poll_flush(cx)
	}
	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.io).poll_shutdown(cx)
	}
}
