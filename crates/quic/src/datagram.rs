//! UDP datagram session manager: each QUIC datagram is tagged
//! with a one-byte kind and, for UDP sessions, a 16-byte session UUID, so a
//! single unreliable-datagram channel can multiplex many origin-bound UDP
//! flows plus ICMP packets.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use tunnel_origin::TooManyActiveFlows;

use crate::wire;

const KIND_SESSION: u8 = 0;
const KIND_ICMP: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
	Session(Uuid),
	Icmp,
}

/// Splits a raw QUIC datagram into its routing tag and payload. The tag
/// (and, for sessions, the UUID) trails the payload rather than leading it.
pub fn decode_datagram(datagram: Bytes) -> Option<(DatagramKind, Bytes)> {
	if datagram.is_empty() {
		return None;
	}
	let tag = datagram[datagram.len() - 1];
	let body = datagram.slice(0..datagram.len() - 1);
	match tag {
		KIND_SESSION if body.len() >= 16 => {
			let split_at = body.len() - 16;
			let mut id_bytes = [0u8; 16];
			id_bytes.copy_from_slice(&body[split_at..]);
			Some((DatagramKind::Session(Uuid::from_bytes(id_bytes)), body.slice(0..split_at)))
		},
		KIND_ICMP => Some((DatagramKind::Icmp, body)),
		_ => None,
	}
}

/// Appends the routing tag (and, for sessions, the UUID) after the payload
/// before handing it to the QUIC connection's unreliable-datagram sender.
pub fn encode_datagram(kind: DatagramKind, payload: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(payload.len() + 17);
	buf.put_slice(payload);
	match kind {
		DatagramKind::Session(id) => {
			buf.put_slice(id.as_bytes());
			buf.put_u8(KIND_SESSION);
		},
		DatagramKind::Icmp => buf.put_u8(KIND_ICMP),
	}
	buf.freeze()
}

/// Why a session's serve loop exited. Used both for
/// logging and as the `reason` string sent with `unregister_udp_session`
/// when the edge didn't already know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
	ClosedByOrigin,
	ClosedByRemote,
	ClosedByTimeout,
	ParentConnectionClosed,
}

impl CloseReason {
	fn message(&self, idle: Duration) -> String {
		match self {
			CloseReason::ClosedByOrigin => "closed by origin".to_string(),
			CloseReason::ClosedByRemote => "closed by remote".to_string(),
			CloseReason::ClosedByTimeout => format!("session idle for {}ms", idle.as_millis()),
			CloseReason::ParentConnectionClosed => "parent connection closed".to_string(),
		}
	}

	/// Whether the edge already knows about this closure (so no
	/// `unregister_udp_session` call is needed).
	fn remote_initiated(&self) -> bool {
		matches!(self, CloseReason::ClosedByRemote)
	}
}

/// One origin-bound UDP flow. The datagram-receive task routes decoded
/// session datagrams here; the session's own task drains `inbound` and
/// writes replies back out through `outbound`.
struct Session {
	inbound: mpsc::Sender<Bytes>,
	/// Set by `unregister` so the serve loop knows the closure was
	/// remote-initiated and should not re-announce it.
	remote_unregistered: Arc<std::sync::atomic::AtomicBool>,
}

/// Registers, serves, and unregisters UDP sessions, and enforces the
/// maximum number of concurrently active flows shared across UDP and TCP.
pub struct SessionManager {
	sessions: Arc<parking_lot::Mutex<HashMap<Uuid, Session>>>,
	flow_limiter: Arc<Semaphore>,
	outbound: mpsc::Sender<Bytes>,
	conn: quinn::Connection,
}

impl SessionManager {
	pub fn new(max_active_flows: usize, outbound: mpsc::Sender<Bytes>, conn: quinn::Connection) -> Self {
		SessionManager {
			sessions: Arc::new(parking_lot::Mutex::new(HashMap::new())),
			flow_limiter: Arc::new(Semaphore::new(max_active_flows)),
			outbound,
			conn,
		}
	}

	/// Registers a new session and spawns its serve loop: reads the
	/// connected UDP socket and forwards bytes to the edge as datagrams,
	/// simultaneously draining the demultiplex queue into the socket. Returns
	/// an error without inserting into the session map if the flow limiter
	/// is exhausted or the local UDP socket can't be bound/connected; the
	/// permit is released by dropping it in that case.
	pub async fn register(&self, session_id: Uuid, dest: SocketAddr, close_after_idle: Duration) -> anyhow::Result<()> {
		let permit = self.flow_limiter.clone().try_acquire_owned().map_err(|_| TooManyActiveFlows)?;
		let dest = normalize_v4_in_v6(dest);

		let socket = UdpSocket::bind((IpAddr::from([0, 0, 0, 0]), 0)).await?;
		socket.connect(dest).await?;

		let (tx, rx) = mpsc::channel(256);
		let remote_unregistered = Arc::new(std::sync::atomic::AtomicBool::new(false));
		self.sessions.lock().insert(session_id, Session { inbound: tx, remote_unregistered: remote_unregistered.clone() });

		let sessions = self.sessions.clone();
		let outbound = self.outbound.clone();
		let conn = self.conn.clone();
		tokio::spawn(async move {
			let reason = serve_session(socket, rx, outbound, session_id, close_after_idle).await;
			sessions.lock().remove(&session_id);
			if !reason.remote_initiated() && !remote_unregistered.load(std::sync::atomic::Ordering::Acquire) {
				if let Err(err) = wire::send_unregister_udp_session(&conn, session_id, reason.message(close_after_idle)).await {
					warn!(%session_id, error = %err, "failed to notify edge of udp session teardown");
				}
			}
			drop(permit);
		});
		Ok(())
	}

	/// Idempotent; removes from the map and lets the serving task observe
	/// the closed inbound channel and exit.
	pub fn unregister(&self, session_id: Uuid) {
		if let Some(session) = self.sessions.lock().remove(&session_id) {
			session.remote_unregistered.store(true, std::sync::atomic::Ordering::Release);
		}
	}

	/// Routes one decoded inbound datagram to its session, dropping it with
	/// a warning if the session is unknown (already unregistered, or a
	/// datagram arrived out of order after teardown).
	pub fn route_inbound(&self, session_id: Uuid, payload: Bytes) {
		let sender = self.sessions.lock().get(&session_id).map(|s| s.inbound.clone());
		match sender {
			Some(sender) => {
				if sender.try_send(payload).is_err() {
					warn!(%session_id, "udp session inbound queue full, dropping datagram");
				}
			},
			None => warn!(%session_id, "datagram for unknown udp session"),
		}
	}

	/// Number of sessions currently tracked; used by the connection's
	/// close path to decide whether there is any teardown left to wait for.
	pub fn active_count(&self) -> usize {
		self.sessions.lock().len()
	}
}

/// Runs one session's bidirectional pipe until the UDP socket errors, the
/// idle timer fires, or `inbound` closes (remote unregister or parent
/// shutdown). Datagrams are forwarded in arrival order in each direction;
/// no retransmission or reordering is attempted.
async fn serve_session(socket: UdpSocket, mut inbound: mpsc::Receiver<Bytes>, outbound: mpsc::Sender<Bytes>, session_id: Uuid, close_after_idle: Duration) -> CloseReason {
	let mut last_activity = Instant::now();
	let mut recv_buf = vec![0u8; 64 * 1024];

	loop {
		let idle_budget = close_after_idle.saturating_sub(last_activity.elapsed());
		tokio::select! {
			biased;

			payload = inbound.recv() => {
				match payload {
					Some(payload) => {
						last_activity = Instant::now();
						if socket.send(&payload).await.is_err() {
							return CloseReason::ClosedByOrigin;
						}
					},
					None => return CloseReason::ClosedByRemote,
				}
			},

			result = socket.recv(&mut recv_buf) => {
				match result {
					Ok(0) | Err(_) => return CloseReason::ClosedByOrigin,
					Ok(n) => {
						last_activity = Instant::now();
						let framed = encode_datagram(DatagramKind::Session(session_id), &recv_buf[..n]);
						if outbound.send(framed).await.is_err() {
							return CloseReason::ParentConnectionClosed;
						}
					},
				}
			},

			_ = tokio::time::sleep(idle_budget) => {
				if last_activity.elapsed() >= close_after_idle {
					return CloseReason::ClosedByTimeout;
				}
			},
		}
	}
}

/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are normalized to plain
/// IPv4 before dialing.
fn normalize_v4_in_v6(addr: SocketAddr) -> SocketAddr {
	match addr.ip() {
		IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
			Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
			None => addr,
		},
		IpAddr::V4(_) => addr,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_session_datagrams() {
		let id = Uuid::new_v4();
		let encoded = encode_datagram(DatagramKind::Session(id), b"hello");
		let (kind, payload) = decode_datagram(encoded).unwrap();
		assert_eq!(kind, DatagramKind::Session(id));
		assert_eq!(&payload[..], b"hello");
	}

	#[test]
	fn round_trips_icmp_datagrams() {
		let encoded = encode_datagram(DatagramKind::Icmp, b"ping");
		let (kind, payload) = decode_datagram(encoded).unwrap();
		assert_eq!(kind, DatagramKind::Icmp);
		assert_eq!(&payload[..], b"ping");
	}

	#[test]
	fn empty_datagram_decodes_to_none() {
		assert!(decode_datagram(Bytes::new()).is_none());
	}

	#[test]
	fn session_datagram_places_uuid_and_tag_after_payload() {
		let id = Uuid::new_v4();
		let encoded = encode_datagram(DatagramKind::Session(id), b"hello");
		assert_eq!(&encoded[..5], b"hello");
		assert_eq!(&encoded[5..21], id.as_bytes());
		assert_eq!(encoded[21], KIND_SESSION);
		assert_eq!(encoded.len(), 22);
	}

	#[test]
	fn icmp_datagram_places_tag_after_payload() {
		let encoded = encode_datagram(DatagramKind::Icmp, b"ping");
		assert_eq!(&encoded[..4], b"ping");
		assert_eq!(encoded[4], KIND_ICMP);
	}

	#[test]
	fn v4_mapped_v6_normalizes_to_v4() {
		let mapped: SocketAddr = "[::ffff:10.0.0.1]:9000".parse().unwrap();
		let normalized = normalize_v4_in_v6(mapped);
		assert_eq!(normalized, "10.0.0.1:9000".parse().unwrap());
	}

	#[test]
	fn plain_v4_is_unchanged() {
		let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
		assert_eq!(normalize_v4_in_v6(addr), addr);
	}
}
