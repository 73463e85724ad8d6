//! Adapts one QUIC bidirectional stream into `tokio::io::{AsyncRead,
//! AsyncWrite}` plus a `HeaderSink`, the same shape `tunnel_h2::stream_io`
//! gives the H2 connection.
//!
//! Unlike h2, QUIC hands over both stream halves immediately on
//! `open_bi`/`accept_bi` — there is no need to wait on a header send before
//! the write half exists. The shared cell here only serializes the
//! handshake-message write done by [`QuicHeaderSink`] against the raw body
//! writes done by [`QuicStreamIo`], so the two never race on the same
//! stream.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use tunnel_wire::{HeaderSink, SharedAck};

use crate::wire::{self, ConnectResponseData};

type SharedSend = Arc<Mutex<Option<quinn::SendStream>>>;

/// Writes the stream's one `ConnectResponseData` handshake message, then
/// hands the `SendStream` over to the shared cell its paired
/// [`QuicStreamIo`] writes body bytes through.
pub struct QuicHeaderSink {
	send: Option<quinn::SendStream>,
	shared: SharedSend,
}

#[async_trait]
impl HeaderSink for QuicHeaderSink {
	async fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
		let mut send = self.send.take().ok_or_else(|| anyhow::anyhow!("send_headers called twice"))?;
		wire::write_message(&mut send, &ConnectResponseData { status, headers }).await?;
		*self.shared.lock().unwrap() = Some(send);
		Ok(())
	}
}

/// The read/write half of one proxied QUIC stream. Reading drains the
/// `RecvStream` directly; writing waits for `QuicHeaderSink` to have
/// released the `SendStream` into the shared cell.
pub struct QuicStreamIo {
	recv: quinn::RecvStream,
	shared: SharedSend,
}

pub fn stream_io_pair(send: quinn::SendStream, recv: quinn::RecvStream) -> (QuicStreamIo, QuicHeaderSink) {
	let shared: SharedSend = Arc::new(Mutex::new(None));
	(QuicStreamIo { recv, shared: shared.clone() }, QuicHeaderSink { send: Some(send), shared })
}

impl AsyncRead for QuicStreamIo {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.recv).poll_read(cx, buf)
	}
}

impl AsyncWrite for QuicStreamIo {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		let mut guard = self.shared.lock().unwrap();
		match guard.as_mut() {
			Some(send) => Pin::new(send).poll_write(cx, buf),
			None => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "write attempted before headers were sent"))),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		let mut guard = self.shared.lock().unwrap();
		match guard.as_mut() {
			Some(send) => Pin::new(send).poll_flush(cx),
			None => Poll::Ready(Ok(())),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		let mut guard = self.shared.lock().unwrap();
		match guard.as_mut() {
			Some(send) => Pin::new(send).poll_shutdown(cx),
			None => Poll::Ready(Ok(())),
		}
	}
}

/// A TCP-dispatched QUIC stream: reading/writing go straight through to
/// the stream body once `ack()` has sent the empty connect-response that
/// tells the edge the origin accepted the connection.
pub struct AckableStream {
	io: QuicStreamIo,
	header_sink: SharedAck<QuicHeaderSink>,
}

impl AckableStream {
	pub fn new(io: QuicStreamIo, header_sink: SharedAck<QuicHeaderSink>) -> Self {
		AckableStream { io, header_sink }
	}
}

#[async_trait]
impl tunnel_origin::Acker for AckableStream {
	async fn ack(&mut self, trace: Option<String>) -> anyhow::Result<()> {
		let headers = trace.into_iter().map(|t| ("trace".to_string(), t)).collect();
		self.header_sink.send_if_unused(200, headers).await?;
		Ok(())
	}
}

impl AsyncRead for AckableStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.io).poll_read(cx, buf)
	}
}

impl AsyncWrite for AckableStream {
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
