//! Shared-ownership handle around a not-yet-used [`HeaderSink`]: a
//! TCP-proxied stream's `Acker` impl needs to send the "connection
//! accepted" headers from inside the stream itself, but if the proxy call
//! returns before ever acking, the connection driver still needs to reach
//! the same sink afterward to send an error response instead. Both sides
//! hold a clone of the same cell; whichever gets there first consumes it.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::HeaderSink;

#[derive(Clone)]
pub struct SharedAck<S> {
	inner: Arc<Mutex<Option<S>>>,
}

impl<S: HeaderSink> SharedAck<S> {
	pub fn new(sink: S) -> Self {
		SharedAck { inner: Arc::new(Mutex::new(Some(sink))) }
	}

	/// Sends headers through the sink if nobody has taken it yet. Returns
	/// `false` if another caller already sent headers first.
	pub async fn send_if_unused(&self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		match guard.take() {
			Some(mut sink) => {
				sink.send_headers(status, headers).await?;
				Ok(true)
			},
			None => Ok(false),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::Mutex as StdMutex;

	#[derive(Clone, Default)]
	struct RecordingSink {
		sent: Arc<StdMutex<Vec<(u16, Vec<(String, String)>)>>>,
	}

	#[async_trait]
	impl HeaderSink for RecordingSink {
		async fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> anyhow::Result<()> {
			self.sent.lock().unwrap().push((status, headers));
			Ok(())
		}
	}

	#[tokio::test]
	async fn second_send_after_first_is_a_no_op() {
		let shared = SharedAck::new(RecordingSink::default());
		assert!(shared.send_if_unused(200, vec![]).await.unwrap());
		assert!(!shared.send_if_unused(502, vec![]).await.unwrap());
	}

	#[tokio::test]
	async fn clones_share_the_same_sink() {
		let shared = SharedAck::new(RecordingSink::default());
		let clone = shared.clone();
		assert!(clone.send_if_unused(200, vec![]).await.unwrap());
		assert!(!shared.send_if_unused(502, vec![]).await.unwrap());
	}
}
