//! Per-stream handshake messages and the stream duplex adapter.
//!
//! QUIC streams carry no HTTP/2-style header frame, so the connection
//! exchanges one small bincode message before any proxied bytes: the peer
//! opening a stream sends a [`ConnectRequest`] describing what the stream
//! is for, the acceptor answers with a [`ConnectResponseData`] before
//! either side writes payload bytes.

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use tunnel_transport::RequestKind;

/// Sent once, first, on every bidirectional stream the edge opens. Carries the same classification and header information the H2
/// connection gets for free from HTTP/2 framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
	pub kind: WireRequestKind,
	pub headers: Vec<(String, String)>,
}

/// `RequestKind` is not itself `Serialize` (it is a pure in-process tag);
/// this mirrors it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRequestKind {
	WebSocket,
	Tcp,
	ControlStream,
	Http,
	ConfigurationUpdate,
	/// Negotiates a UDP session id before any bytes move over datagrams.
	/// Not part of `tunnel_transport::RequestKind` since UDP never rides a
	/// stream once the session is established.
	UdpSession,
	/// A fresh, short-lived stream carrying one `UnregisterUdpSession` call
	/// and nothing else.
	UnregisterUdpSession,
}

impl TryFrom<WireRequestKind> for RequestKind {
	type Error = ();

	fn try_from(k: WireRequestKind) -> Result<Self, Self::Error> {
		match k {
			WireRequestKind::WebSocket => Ok(RequestKind::WebSocket),
			WireRequestKind::Tcp => Ok(RequestKind::Tcp),
			WireRequestKind::ControlStream => Ok(RequestKind::ControlStream),
			WireRequestKind::Http => Ok(RequestKind::Http),
			WireRequestKind::ConfigurationUpdate => Ok(RequestKind::ConfigurationUpdate),
			WireRequestKind::UdpSession => Err(()),
			WireRequestKind::UnregisterUdpSession => Err(()),
		}
	}
}

/// The acceptor's reply to a [`ConnectRequest`]: a status plus any response
/// headers known before the body starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponseData {
	pub status: u16,
	pub headers: Vec<(String, String)>,
}

/// Payload of a `ConnectRequest { kind: UdpSession, .. }` stream: the
/// session id subsequent datagrams will be tagged with, the origin address to dial, and the
/// idle-close hint the edge supplied at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpSessionRequest {
	pub session_id: uuid::Uuid,
	pub dest: String,
	pub close_after_idle_secs: u64,
	pub trace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpSessionResponse {
	pub accepted: bool,
}

/// `unregister_udp_session(session-id, reason)`, sent on
/// a fresh short-lived RPC stream when a session ends for any reason other
/// than the edge itself calling this RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterUdpSession {
	pub session_id: uuid::Uuid,
	pub reason: String,
}

/// Payload of a `ConnectRequest { kind: ConfigurationUpdate, .. }` stream.
/// The config body travels as raw JSON bytes rather than a parsed
/// `serde_json::Value`: bincode (unlike JSON) isn't self-describing, and
/// `Value`'s `Deserialize` impl needs `deserialize_any`, which bincode
/// can't satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
	pub version: i32,
	pub config_json: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateResponse {
	pub last_applied_version: i32,
	pub err: Option<String>,
}

/// Reads one length-prefixed bincode message from `stream`.
pub async fn read_message<T: for<'de> Deserialize<'de>>(stream: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<T> {
	let len = stream.read_u32().await? as usize;
	let mut buf = vec![0u8; len];
	stream.read_exact(&mut buf).await?;
	Ok(bincode::deserialize(&buf)?)
}

/// Writes one length-prefixed bincode message to `stream`.
pub async fn write_message<T: Serialize>(stream: &mut (impl AsyncWrite + Unpin), message: &T) -> anyhow::Result<()> {
	let encoded = bincode::serialize(message)?;
	stream.write_u32(encoded.len() as u32).await?;
	stream.write_all(&encoded).await?;
	Ok(())
}

/// Joins a QUIC `SendStream`/`RecvStream` pair into one
/// `AsyncRead + AsyncWrite` value, the same shape `tunnel_wire::RpcClient`
/// and `tunnel_control::ControlStream` expect from an H2 stream.
pub struct StreamDuplex {
	send: quinn::SendStream,
	recv: quinn::RecvStream,
}

impl StreamDuplex {
	pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
		StreamDuplex { send, recv }
	}

	/// Splits back into the raw stream halves, e.g. once the handshake
	/// message has been read off a duplex and the rest of the dispatch only
	/// needs the independent read/write sides.
	pub fn into_parts(self) -> (quinn::SendStream, quinn::RecvStream) {
		(self.send, self.recv)
	}
}

impl AsyncRead for StreamDuplex {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().recv).poll_read(cx, buf)
	}
}

impl AsyncWrite for StreamDuplex {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.get_mut().send).poll_write(cx, buf)
	}
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().send).poll_flush(cx)
	}
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().send).poll_shutdown(cx)
	}
}

/// Opens a fresh bidirectional stream and calls `unregister_udp_session`
/// on it, then lets the stream close. Logged by the caller, never fails the
/// session's own teardown.
pub async fn send_unregister_udp_session(conn: &quinn::Connection, session_id: uuid::Uuid, reason: String) -> anyhow::Result<()> {
	let (send, recv) = conn.open_bi().await?;
	let mut duplex = StreamDuplex::new(send, recv);
	write_message(&mut duplex, &ConnectRequest { kind: WireRequestKind::UnregisterUdpSession, headers: Vec::new() }).await?;
	write_message(&mut duplex, &UnregisterUdpSession { session_id, reason }).await?;
	let _ack: UdpSessionResponse = read_message(&mut duplex).await?;
	Ok(())
}
