//! Control-stream handler: the state machine that owns registration,
//! unregistration, and configuration pushes over one connection's RPC
//! stream.
//!
//! State transitions are linear and one-directional: `Init -> Registered ->
//! Unregistering -> Done`. Only the task driving the control stream calls
//! the mutating methods; other tasks (the per-stream dispatch loop in the
//! H2/QUIC connection) only ever read `is_stopped()` via the shared
//! [`ControlState`] handle, which is why state lives behind an atomic
//! rather than a mutex guarding the whole handler.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use tunnel_core::error::RegistrationError;
use tunnel_core::{ConnectionOptions, Credentials};
use tunnel_observer::{Event, Observer};
use tunnel_wire::{ConnectionDetails, RpcClient};

/// Grace periods longer than this are clamped: the edge will have already
/// reclaimed the slot by then, so waiting longer just delays shutdown for
/// no benefit.
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(180);

const STATE_INIT: u8 = 0;
const STATE_REGISTERED: u8 = 1;
const STATE_UNREGISTERING: u8 = 2;
const STATE_DONE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Init,
	Registered,
	Unregistering,
	Done,
}

impl From<u8> for State {
	fn from(v: u8) -> Self {
		match v {
			STATE_INIT => State::Init,
			STATE_REGISTERED => State::Registered,
			STATE_UNREGISTERING => State::Unregistering,
			_ => State::Done,
		}
	}
}

/// The piece of a control stream's state other tasks need to observe
/// without touching the RPC client itself.
pub struct ControlState {
	state: AtomicU8,
	fuse: Mutex<Option<oneshot::Sender<()>>>,
}

impl ControlState {
	fn new(fuse: oneshot::Sender<()>) -> Self {
		ControlState {
			state: AtomicU8::new(STATE_INIT),
			fuse: Mutex::new(Some(fuse)),
		}
	}

	pub fn get(&self) -> State {
		State::from(self.state.load(Ordering::Acquire))
	}

	/// True once the connection has entered terminal unregistered state; the
	/// H2/QUIC dispatch loop uses this to stop accepting new streams.
	pub fn is_stopped(&self) -> bool {
		self.state.load(Ordering::Acquire) == STATE_DONE
	}

	fn set(&self, state: u8) {
		self.state.store(state, Ordering::Release);
	}

	/// Fires the connected fuse exactly once; later calls are no-ops. Used
	/// to wake a supervisor task blocked on "first successful registration"
	/// without caring whether this is the first attempt or a reconnect.
	fn fire_connected_fuse(&self) {
		if let Some(tx) = self.fuse.lock().unwrap().take() {
			let _ = tx.send(());
		}
	}
}

/// Drives one connection's control stream through registration,
/// configuration pushes, and graceful unregistration.
pub struct ControlStream<S> {
	rpc: RpcClient<S>,
	observer: Arc<Observer>,
	connection_index: u8,
	state: Arc<ControlState>,
}

impl<S> ControlStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	/// Returns the handler plus the shared state handle and a receiver that
	/// resolves once this connection first reaches `Registered`.
	pub fn new(stream: S, observer: Arc<Observer>, connection_index: u8) -> (Self, Arc<ControlState>, oneshot::Receiver<()>) {
		let (tx, rx) = oneshot::channel();
		let state = Arc::new(ControlState::new(tx));
		let handler = ControlStream {
			rpc: RpcClient::new(stream),
			observer,
			connection_index,
			state: state.clone(),
		};
		(handler, state, rx)
	}

	pub fn state(&self) -> State {
		self.state.get()
	}

	pub fn is_stopped(&self) -> bool {
		self.state.is_stopped()
	}

	/// Registers the connection. On success the handler transitions to
	/// `Registered`, fires the connected fuse, and publishes a `Connected`
	/// event; on failure it stays in `Init` so the caller can retry (or
	/// fall back to a different transport) without rebuilding the handler.
	pub async fn register(
		&mut self,
		credentials: &Credentials,
		options: ConnectionOptions,
		protocol: tunnel_transport::TransportKind,
		edge_ip: IpAddr,
	) -> Result<ConnectionDetails, RegistrationError> {
		self.observer.publish(self.connection_index, Event::RegisteringTunnel);

		let result = self
			.rpc
			.register_connection(credentials.secret().to_vec(), credentials.tunnel_id, self.connection_index, options)
			.await;

		match result {
			Ok(details) => {
				self.state.set(STATE_REGISTERED);
				self.state.fire_connected_fuse();
				self.observer.publish(
					self.connection_index,
					Event::Connected { protocol, location: details.location.clone(), edge_ip },
				);
				Ok(details)
			},
			Err(err) => {
				self.observer.publish(self.connection_index, Event::RegistrationFailed { retryable: err.is_retryable() });
				Err(err)
			},
		}
	}

	/// Best-effort push of the agent's local configuration. Does not change
	/// the handler's state; failures are returned to the caller to log, not
	/// treated as connection-fatal.
	pub async fn push_local_configuration(&mut self, config: Vec<u8>) -> anyhow::Result<()> {
		self.rpc.send_local_configuration(config).await?;
		self.observer.record_local_config_push();
		Ok(())
	}

	/// Begins graceful shutdown: tells the edge to unregister this
	/// connection, waiting up to `grace_period` (clamped to
	/// [`MAX_GRACE_PERIOD`]). Always ends in `Done`, even if the RPC times
	/// out or errors, since there is no useful retry for a connection that's
	/// going away regardless.
	pub async fn begin_unregister(&mut self, grace_period: Duration) {
		if self.state.get() == State::Done {
			return;
		}
		self.state.set(STATE_UNREGISTERING);
		self.observer.publish(self.connection_index, Event::Unregistering);

		let deadline = grace_period.min(MAX_GRACE_PERIOD);
		if let Err(err) = self.rpc.unregister_connection(deadline).await {
			warn!(connection_index = self.connection_index, error = %err, "unregister did not complete cleanly");
		}
		self.rpc.close().await;

		self.state.set(STATE_DONE);
		self.observer.publish(self.connection_index, Event::Disconnected);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::{SinkExt, StreamExt};
	use std::net::Ipv4Addr;
	use tokio_util::codec::{Framed, LengthDelimitedCodec};
	use tunnel_core::BuildInfo;

	// Mirrors tunnel_wire::rpc's private `RpcResponse` exactly (same
	// variants, same order) so bincode's variant tags line up; that type
	// isn't exported, so tests drive the wire format through a stand-in
	// shaped identically to it instead.
	#[derive(serde::Serialize)]
	enum WireResponse {
		Registered(ConnectionDetails),
		RegisterError { duplicate_connection: bool, retryable: bool, message: String },
		Ack,
		#[allow(dead_code)]
		Error(String),
	}

	enum ServerReply {
		Registered { location: String, uuid: Uuid, remotely_managed: bool },
		DuplicateConnection,
		Ack,
	}

	async fn spawn_scripted_server(server_stream: tokio::io::DuplexStream, replies: Vec<ServerReply>) {
		tokio::spawn(async move {
			let mut framed = Framed::new(server_stream, LengthDelimitedCodec::new());
			let mut replies = replies.into_iter();
			while let Some(Ok(_frame)) = framed.next().await {
				// The handler under test always calls in the order the
				// `replies` vec anticipates; we don't need to decode the
				// request to know which reply to send next.
				let Some(reply) = replies.next() else { break };
				let wire = match reply {
					ServerReply::Registered { location, uuid, remotely_managed } => {
						WireResponse::Registered(ConnectionDetails { location, uuid, remotely_managed })
					},
					ServerReply::DuplicateConnection => {
						WireResponse::RegisterError { duplicate_connection: true, retryable: false, message: "EDUPCONN".to_string() }
					},
					ServerReply::Ack => WireResponse::Ack,
				};
				let encoded = bincode::serialize(&wire).unwrap();
				if framed.send(encoded.into()).await.is_err() {
					break;
				}
			}
		});
	}

	fn options() -> ConnectionOptions {
		ConnectionOptions::new(BuildInfo::current(), 0)
	}

	fn creds() -> Credentials {
		Credentials::new("acct", Uuid::nil(), b"secret".to_vec())
	}

	#[tokio::test]
	async fn register_transitions_to_registered_and_fires_fuse() {
		let (client, server) = tokio::io::duplex(4096);
		spawn_scripted_server(server, vec![ServerReply::Registered { location: "lhr".to_string(), uuid: Uuid::nil(), remotely_managed: false }]).await;

		let observer = Arc::new(Observer::new());
		let (mut handler, state, connected_rx) = ControlStream::new(client, observer, 0);
		assert_eq!(handler.state(), State::Init);

		let details = handler
			.register(&creds(), options(), tunnel_transport::TransportKind::Quic, IpAddr::V4(Ipv4Addr::LOCALHOST))
			.await
			.unwrap();

		assert_eq!(details.location, "lhr");
		assert_eq!(state.get(), State::Registered);
		assert!(!state.is_stopped());
		connected_rx.await.expect("fuse should have fired");
	}

	#[tokio::test]
	async fn duplicate_connection_keeps_state_in_init() {
		let (client, server) = tokio::io::duplex(4096);
		spawn_scripted_server(server, vec![ServerReply::DuplicateConnection]).await;

		let observer = Arc::new(Observer::new());
		let (mut handler, state, _connected_rx) = ControlStream::new(client, observer, 0);

		let err = handler
			.register(&creds(), options(), tunnel_transport::TransportKind::Quic, IpAddr::V4(Ipv4Addr::LOCALHOST))
			.await
			.unwrap_err();

		assert!(matches!(err, RegistrationError::DuplicateConnection));
		assert_eq!(state.get(), State::Init);
	}

	#[tokio::test]
	async fn begin_unregister_reaches_done_even_without_a_server() {
		let (client, _server) = tokio::io::duplex(4096);
		let observer = Arc::new(Observer::new());
		let (mut handler, state, _connected_rx) = ControlStream::new(client, observer, 0);

		handler.begin_unregister(Duration::from_millis(20)).await;
		assert_eq!(state.get(), State::Done);
		assert!(state.is_stopped());
	}

	#[tokio::test]
	async fn grace_period_longer_than_max_is_clamped() {
		assert_eq!(Duration::from_secs(600).min(MAX_GRACE_PERIOD), MAX_GRACE_PERIOD);
	}
}
