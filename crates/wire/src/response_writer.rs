//! Response writer: a stream-typed writer that flushes on the
//! right content types and rewrites the switching-protocols status.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::header_codec::{self, ResponseSource};
use tunnel_transport::RequestKind;

/// Where `write_headers` actually hands the header list off to the
/// underlying multiplex layer. The H2 connection implements this over
/// `hyper`'s response parts; the QUIC connection implements it by sending
/// a `ConnectResponseData` message.
#[async_trait]
pub trait HeaderSink: Send {
	async fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResponseWriterError {
	#[error("hijack() called before headers were written")]
	HijackBeforeHeaders,
}

/// Status 101 is rewritten to 200 before sending: the underlying HTTP/2
/// layer forbids switching-protocols.
const SWITCHING_PROTOCOLS: u16 = 101;
const REWRITTEN_STATUS: u16 = 200;

pub struct ResponseWriter<S, W> {
	sink: S,
	writer: W,
	request_kind: RequestKind,
	/// Whether every `write()` flushes regardless of response headers.
	/// Fixed for WebSocket/TCP/control streams; re-derived from headers
	/// for plain HTTP.
	flush_always: bool,
	status_written: bool,
}

impl<S, W> ResponseWriter<S, W>
where
	S: HeaderSink,
	W: AsyncWrite + Unpin + Send,
{
	pub fn new(sink: S, writer: W, request_kind: RequestKind) -> Self {
		Self {
			sink,
			writer,
			flush_always: request_kind.always_flushes(),
			request_kind,
			status_written: false,
		}
	}

	/// Writes response headers; rewrites 101 to 200. Records
	/// `status_written = true` on success.
	pub async fn write_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
		let status = if status == SWITCHING_PROTOCOLS { REWRITTEN_STATUS } else { status };

		if matches!(self.request_kind, tunnel_transport::RequestKind::Http) {
			let content_type = find_header(&headers, "content-type");
			let content_length = find_header(&headers, "content-length").and_then(|v| v.parse::<i64>().ok());
			let transfer_encoding = find_header(&headers, "transfer-encoding");
			self.flush_always = header_codec::should_flush_http(
				content_type.as_deref(),
				content_length,
				transfer_encoding.as_deref(),
			);
		}

		self.sink.send_headers(status, headers).await?;
		self.status_written = true;
		Ok(())
	}

	/// Writes body bytes, flushing according to the policy captured at
	/// `write_headers` time.
	pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
		self.writer.write_all(data).await?;
		if self.flush_always {
			self.writer.flush().await?;
		}
		Ok(())
	}

	pub fn status_written(&self) -> bool {
		self.status_written
	}

	/// Writes a bad-gateway error response plus the cloudflared
	/// response-meta header. Returns `false` (a no-op) if headers were
	/// already sent — the caller must then abort rather than attempt a
	/// second response.
	pub async fn write_error_response(&mut self, rate_limited: bool) -> anyhow::Result<bool> {
		if self.status_written {
			return Ok(false);
		}
		let source = if rate_limited { ResponseSource::FlowRateLimited } else { ResponseSource::Cloudflared };
		let headers = header_codec::encode_response(502, &[], source);
		// encode_response already includes :status; strip it since
		// write_headers takes status separately.
		let headers: Vec<(String, String)> = headers.into_iter().filter(|(k, _)| k != ":status").collect();
		self.write_headers(502, headers).await?;
		Ok(true)
	}

	/// Returns the raw read/write halves for TCP-style proxies. Legal only
	/// *after* status was written; calling it before is a protocol error.
	pub fn hijack(self) -> Result<W, ResponseWriterError> {
		if !self.status_written {
			return Err(ResponseWriterError::HijackBeforeHeaders);
		}
		Ok(self.writer)
	}
}

impl<S, W> ResponseWriter<S, W>
where
	W: AsyncRead + AsyncWrite + Unpin + Send,
{
	pub fn into_raw_stream(self) -> W {
		self.writer
	}
}

fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
	headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};

	#[derive(Clone, Default)]
	struct RecordingSink {
		sent: Arc<Mutex<Vec<(u16, Vec<(String, String)>)>>>,
	}

	#[async_trait]
	impl HeaderSink for RecordingSink {
		async fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
			self.sent.lock().unwrap().push((status, headers));
			Ok(())
		}
	}

	#[tokio::test]
	async fn rewrites_switching_protocols_to_200() {
		let sink = RecordingSink::default();
		let buf = tokio::io::sink();
		let mut writer = ResponseWriter::new(sink.clone(), buf, RequestKind::WebSocket);
		writer.write_headers(101, vec![]).await.unwrap();
		assert_eq!(sink.sent.lock().unwrap()[0].0, 200);
	}

	#[tokio::test]
	async fn second_error_response_after_headers_sent_is_a_no_op() {
		let sink = RecordingSink::default();
		let buf = tokio::io::sink();
		let mut writer = ResponseWriter::new(sink, buf, RequestKind::Http);
		writer.write_headers(200, vec![]).await.unwrap();
		assert!(!writer.write_error_response(false).await.unwrap());
	}

	#[tokio::test]
	async fn error_response_writes_bad_gateway_when_nothing_sent_yet() {
		let sink = RecordingSink::default();
		let buf = tokio::io::sink();
		let mut writer = ResponseWriter::new(sink.clone(), buf, RequestKind::Http);
		assert!(writer.write_error_response(false).await.unwrap());
		let (status, headers) = sink.sent.lock().unwrap()[0].clone();
		assert_eq!(status, 502);
		assert!(headers.iter().any(|(k, v)| k == "cf-cloudflared-response-meta" && v.contains("cloudflared")));
	}

	#[tokio::test]
	async fn rate_limited_error_response_tags_flow_rate_limited() {
		let sink = RecordingSink::default();
		let buf = tokio::io::sink();
		let mut writer = ResponseWriter::new(sink.clone(), buf, RequestKind::Http);
		writer.write_error_response(true).await.unwrap();
		let (_, headers) = sink.sent.lock().unwrap()[0].clone();
		assert!(headers.iter().any(|(k, v)| k == "cf-cloudflared-response-meta" && v.contains("flow-rate-limited")));
	}

	#[tokio::test]
	async fn hijack_before_headers_is_a_protocol_error() {
		let sink = RecordingSink::default();
		let buf = tokio::io::duplex(16).0;
		let writer = ResponseWriter::new(sink, buf, RequestKind::Tcp);
		assert_eq!(writer.hijack().err(), Some(ResponseWriterError::HijackBeforeHeaders));
	}

	#[tokio::test]
	async fn hijack_after_headers_succeeds() {
		let sink = RecordingSink::default();
		let buf = tokio::io::duplex(16).0;
		let mut writer = ResponseWriter::new(sink, buf, RequestKind::Tcp);
		writer.write_headers(200, vec![]).await.unwrap();
		assert!(writer.hijack().is_ok());
	}
}
