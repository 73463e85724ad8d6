//! Transport kind and request kind.

/// Tagged enum {HTTP2, QUIC}. Each variant names the server hostname used
/// for TLS SNI and, for QUIC, the ALPN token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransportKind {
	Http2,
	Quic,
}

impl TransportKind {
	/// SNI hostname to dial for this transport.
	pub fn sni(&self) -> &'static str {
		match self {
			TransportKind::Http2 => "h2.cftunnel.com",
			TransportKind::Quic => "quic.cftunnel.com",
		}
	}

	/// ALPN token, QUIC only.
	pub fn alpn(&self) -> Option<&'static str> {
		match self {
			TransportKind::Http2 => None,
			TransportKind::Quic => Some("argotunnel"),
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			TransportKind::Http2 => "http2",
			TransportKind::Quic => "quic",
		}
	}

	/// Parses a protocol name as supplied by configuration or the remote
	/// percentage fetcher. The legacy name `h2mux` is transparently
	/// upgraded to HTTP2 with a warning.
	pub fn parse(name: &str) -> Option<TransportKind> {
		match name {
			"quic" => Some(TransportKind::Quic),
			"http2" => Some(TransportKind::Http2),
			"h2mux" => {
				tracing::warn!("h2mux protocol is no longer supported, upgrading to http2");
				Some(TransportKind::Http2)
			},
			_ => None,
		}
	}
}

/// Tagged enum driving per-stream flush policy and dispatch target. UDP and ICMP ride datagrams, not streams, so they are not part of
/// this enum; see `tunnel_quic::datagram::DatagramKind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
	WebSocket,
	Tcp,
	ControlStream,
	Http,
	ConfigurationUpdate,
}

impl RequestKind {
	/// WebSocket/TCP/control streams flush after every write.
	pub fn always_flushes(&self) -> bool {
		matches!(
			self,
			RequestKind::WebSocket | RequestKind::Tcp | RequestKind::ControlStream
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn h2mux_upgrades_to_http2() {
		assert_eq!(TransportKind::parse("h2mux"), Some(TransportKind::Http2));
	}

	#[test]
	fn unknown_protocol_is_none() {
		assert_eq!(TransportKind::parse("carrier-pigeon"), None);
	}

	#[test]
	fn sni_and_alpn_are_per_transport() {
		assert_eq!(TransportKind::Http2.sni(), "h2.cftunnel.com");
		assert_eq!(TransportKind::Quic.sni(), "quic.cftunnel.com");
		assert_eq!(TransportKind::Quic.alpn(), Some("argotunnel"));
		assert_eq!(TransportKind::Http2.alpn(), None);
	}

	#[test]
	fn flush_policy_matches_request_kind() {
		assert!(RequestKind::WebSocket.always_flushes());
		assert!(RequestKind::Tcp.always_flushes());
		assert!(RequestKind::ControlStream.always_flushes());
		assert!(!RequestKind::Http.always_flushes());
		assert!(!RequestKind::ConfigurationUpdate.always_flushes());
	}
}
