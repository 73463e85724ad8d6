//! Dials the edge over QUIC: binds the local UDP socket —
//! reusing this connection index's previously recorded source port when
//! possible — then drives the
//! IETF QUIC handshake with TLS 1.3 and ALPN `argotunnel`.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use tunnel_core::error::ConnectionError;

use crate::port_table;

/// Binds a UDP socket for `connection_index`, preferring the port recorded
/// from a previous dial. Falls back to an ephemeral port (and records the
/// new one) if the preferred port is unavailable — e.g. a prior process
/// still holds it during a fast reconnect.
fn bind_socket(connection_index: u8) -> std::io::Result<std::net::UdpSocket> {
	let domain = Domain::IPV6;
	let preferred_port = port_table::recorded_port(connection_index);

	if let Some(port) = preferred_port {
		let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
		socket.set_only_v6(false).ok();
		let addr: SocketAddr = format!("[::]:{port}").parse().unwrap();
		if socket.bind(&addr.into()).is_ok() {
			return Ok(socket.into());
		}
	}

	let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_only_v6(false).ok();
	socket.bind(&"[::]:0".parse::<SocketAddr>().unwrap().into())?;
	let bound: std::net::UdpSocket = socket.into();
	if let Ok(local) = bound.local_addr() {
		port_table::record_port(connection_index, local.port());
	}
	Ok(bound)
}

/// Dials `remote`, returning an established [`quinn::Connection`]. SNI and
/// ALPN are the caller's responsibility via `client_config`
/// (`quic.cftunnel.com` / `argotunnel`).
pub async fn dial(
	remote: SocketAddr,
	server_name: &str,
	client_config: quinn::ClientConfig,
	connection_index: u8,
) -> Result<quinn::Connection, ConnectionError> {
	let socket = bind_socket(connection_index).map_err(|e| ConnectionError::DialEdge(e.into()))?;
	let mut endpoint = quinn::Endpoint::new(quinn::EndpointConfig::default(), None, socket, Arc::new(quinn::TokioRuntime))
		.map_err(|e| ConnectionError::DialEdge(e.into()))?;
	endpoint.set_default_client_config(client_config);

	let connecting = endpoint.connect(remote, server_name).map_err(|e| ConnectionError::DialEdge(e.into()))?;
	connecting.await.map_err(|e| ConnectionError::Handshake(e.into()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn binds_an_ephemeral_port_when_nothing_recorded() {
		let socket = bind_socket(200).unwrap();
		let addr = socket.local_addr().unwrap();
		assert_ne!(addr.port(), 0);
		assert_eq!(port_table::recorded_port(200), Some(addr.port()));
	}

	#[test]
	fn reuses_the_previously_recorded_port_when_free() {
		let first = bind_socket(201).unwrap();
		let port = first.local_addr().unwrap().port();
		drop(first);

		let second = bind_socket(201).unwrap();
		assert_eq!(second.local_addr().unwrap().port(), port);
	}
}
