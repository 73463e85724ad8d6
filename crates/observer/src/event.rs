//! Lifecycle events published by a connection.

use std::net::IpAddr;

use tunnel_transport::TransportKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
	RegisteringTunnel,
	Connected { protocol: TransportKind, location: String, edge_ip: IpAddr },
	Reconnecting,
	SetUrl(String),
	Unregistering,
	Disconnected,
	/// Registration over the control stream failed; `retryable` mirrors
	/// `tunnel_core::error::RegistrationError::is_retryable`.
	RegistrationFailed { retryable: bool },
}

/// An event tagged with the connection index that raised it — the
/// observer is per-agent and fans out events from every active
/// connection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEvent {
	pub connection_index: u8,
	pub event: Event,
}
