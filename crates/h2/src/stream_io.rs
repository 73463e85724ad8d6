//! Adapts one accepted h2 stream into `tokio::io::{AsyncRead, AsyncWrite}`
//! plus a `HeaderSink`, so the rest of the crate can drive it through
//! `tunnel_wire::ResponseWriter` the same way the QUIC connection drives its
//! own streams.
//!
//! h2 only lets you obtain the `SendStream` half by calling
//! `SendResponse::send_response`, which is also how response headers get
//! sent — so the header sink and the write half share one cell that the
//! sink populates and the writer reads from.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h2::{RecvStream, SendStream};
use h2::server::SendResponse;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use tunnel_wire::HeaderSink;

type SharedSend = Arc<Mutex<Option<SendStream<Bytes>>>>;

fn to_io_error(e: h2::Error) -> std::io::Error {
	std::io::Error::new(std::io::ErrorKind::Other, e)
}

/// Sends response headers by calling `h2`'s `send_response`, handing the
/// resulting body-writing half to whichever [`H2StreamIo`] shares its cell.
pub struct H2HeaderSink {
	respond: SendResponse<Bytes>,
	send: SharedSend,
}

impl H2HeaderSink {
	pub fn new(respond: SendResponse<Bytes>, send: SharedSend) -> Self {
		H2HeaderSink { respond, send }
	}
}

#[async_trait]
impl HeaderSink for H2HeaderSink {
	async fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
		let mut builder = http::Response::builder().status(status);
		for (name, value) in &headers {
			builder = builder.header(name.as_str(), value.as_str());
		}
		let response = builder.body(())?;
		let send_stream = self.respond.send_response(response, false)?;
		*self.send.lock().unwrap() = Some(send_stream);
		Ok(())
	}
}

/// The read/write half of one h2 stream. Reading drains `RecvStream`,
/// releasing flow-control credit as data is consumed; writing reserves and
/// sends through the `SendStream` installed by `H2HeaderSink` once headers
/// go out.
pub struct H2StreamIo {
	recv: RecvStream,
	leftover: Option<Bytes>,
	send: SharedSend,
}

pub fn stream_io_pair(recv: RecvStream, respond: SendResponse<Bytes>) -> (H2StreamIo, H2HeaderSink) {
	let send: SharedSend = Arc::new(Mutex::new(None));
	(
		H2StreamIo { recv, leftover: None, send: send.clone() },
		H2HeaderSink::new(respond, send),
	)
}

impl AsyncRead for H2StreamIo {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		loop {
			if let Some(mut chunk) = self.leftover.take() {
				let n = chunk.remaining().min(buf.remaining());
				buf.put_slice(&chunk[..n]);
				chunk.advance(n);
				if !chunk.is_empty() {
					self.leftover = Some(chunk);
				}
				return Poll::Ready(Ok(()));
			}

			match self.recv.poll_data(cx) {
				Poll::Ready(Some(Ok(chunk))) => {
					let _ = self.recv.flow_control().release_capacity(chunk.len());
					self.leftover = Some(chunk);
					continue;
				},
				Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(to_io_error(e))),
				Poll::Ready(None) => return Poll::Ready(Ok(())),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

impl AsyncWrite for H2StreamIo {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		let mut guard = self.send.lock().unwrap();
		let send = match guard.as_mut() {
			Some(send) => send,
			None => return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "write attempted before headers were sent"))),
		};
		send.reserve_capacity(buf.len());
		match send.poll_capacity(cx) {
			Poll::Ready(Some(Ok(cap))) => {
				let n = cap.min(buf.len());
				if n == 0 {
					return Poll::Pending;
				}
				send.send_data(Bytes::copy_from_slice(&buf[..n]), false).map_err(to_io_error)?;
				Poll::Ready(Ok(n))
			},
			Poll::Ready(Some(Err(e))) => Poll::Ready(Err(to_io_error(e))),
			Poll::Ready(None) => Poll::Ready(Ok(0)),
			Poll::Pending => Poll::Pending,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		if let Some(send) = self.send.lock().unwrap().as_mut() {
			let _ = send.send_data(Bytes::new(), true);
		}
		Poll::Ready(Ok(()))
	}
}
