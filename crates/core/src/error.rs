//! Error taxonomy.
//!
//! Two tiers: [`ConnectionError`] is fatal to one connection attempt and is
//! what the supervisor above the core sees; [`RegistrationError`] and
//! [`RequestError`] are narrower errors nested inside it or surfaced per
//! request.

use std::time::Duration;

/// Default retry-after suggested to the supervisor for a retryable
/// registration failure that did not carry its own hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Errors from the `register_connection` RPC.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
	/// The edge rejected registration because another connection already
	/// holds this (account, tunnel, index) slot. Non-retryable.
	#[error("duplicate connection")]
	DuplicateConnection,

	/// Any other registration failure. The edge classifies it as retryable
	/// or permanent; retryable failures carry a suggested retry-after.
	#[error("registration failed: {source}")]
	Server {
		retryable: bool,
		retry_after: Duration,
		#[source]
		source: anyhow::Error,
	},
}

impl RegistrationError {
	pub fn server(retryable: bool, source: anyhow::Error) -> Self {
		RegistrationError::Server {
			retryable,
			retry_after: DEFAULT_RETRY_AFTER,
			source,
		}
	}

	pub fn is_retryable(&self) -> bool {
		match self {
			RegistrationError::DuplicateConnection => false,
			RegistrationError::Server { retryable, .. } => *retryable,
		}
	}
}

/// Errors scoped to one in-flight request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
	/// The flow limiter denied a new UDP session or TCP stream.
	#[error("too many active flows")]
	FlowRateLimited,

	/// The origin proxy returned an error after headers were already sent;
	/// the caller must abort the stream rather than write a second
	/// response.
	#[error("origin proxy error: {0}")]
	OriginProxy(#[source] anyhow::Error),
}

/// Errors fatal to one connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
	#[error("dial edge: {0}")]
	DialEdge(#[source] anyhow::Error),

	#[error("handshake: {0}")]
	Handshake(#[source] anyhow::Error),

	#[error("registration: {0}")]
	Registration(#[from] RegistrationError),

	/// The peer closed the multiplex cleanly; not an error the supervisor
	/// should treat as a failure, just a signal to reconnect.
	#[error("muxer shut down")]
	MuxerShutdown,

	/// The peer dropped the connection without the control stream taking
	/// the graceful shutdown path.
	#[error("edge connection closed")]
	EdgeConnectionClosed,

	#[error("control stream: {0}")]
	ControlStream(#[source] anyhow::Error),

	#[error("stream listener: {0}")]
	StreamListener(#[source] anyhow::Error),

	#[error("datagram manager: {0}")]
	DatagramManager(#[source] anyhow::Error),
}

impl ConnectionError {
	/// Whether the supervisor should pick a fallback transport on its next
	/// dial attempt.
	pub fn suggests_fallback(&self) -> bool {
		matches!(self, ConnectionError::DialEdge(_) | ConnectionError::Handshake(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duplicate_connection_is_not_retryable() {
		assert!(!RegistrationError::DuplicateConnection.is_retryable());
	}

	#[test]
	fn server_error_retryable_flag_is_preserved() {
		let err = RegistrationError::server(true, anyhow::anyhow!("boom"));
		assert!(err.is_retryable());
		let err = RegistrationError::server(false, anyhow::anyhow!("boom"));
		assert!(!err.is_retryable());
	}

	#[test]
	fn dial_and_handshake_suggest_fallback() {
		assert!(ConnectionError::DialEdge(anyhow::anyhow!("x")).suggests_fallback());
		assert!(ConnectionError::Handshake(anyhow::anyhow!("x")).suggests_fallback());
		assert!(!ConnectionError::MuxerShutdown.suggests_fallback());
	}
}
