//! RPC client over a stream: register/unregister/config-push
//! over a length-delimited framed transport atop one HTTP/2 or QUIC
//! stream. The framing itself is opaque to callers; this module picks a
//! concrete one (bincode over `tokio_util`'s length-delimited codec).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use tunnel_core::error::RegistrationError;
use tunnel_core::ConnectionOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
	pub location: String,
	pub uuid: Uuid,
	pub remotely_managed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
enum RpcRequest {
	RegisterConnection {
		auth: Vec<u8>,
		tunnel_id: Uuid,
		conn_index: u8,
		options: ConnectionOptions,
	},
	SendLocalConfiguration {
		config: Vec<u8>,
	},
	UnregisterConnection,
	Close,
}

#[derive(Debug, Serialize, Deserialize)]
enum RpcResponse {
	Registered(ConnectionDetails),
	RegisterError { duplicate_connection: bool, retryable: bool, message: String },
	Ack,
	Error(String),
}

/// One stream turned into a framed RPC conduit. Closing is
/// idempotent: once closed, subsequent calls are no-ops / errors rather
/// than reusing a dead transport.
pub struct RpcClient<S> {
	framed: Framed<S, LengthDelimitedCodec>,
	closed: bool,
}

impl<S> RpcClient<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	pub fn new(stream: S) -> Self {
		Self {
			framed: Framed::new(stream, LengthDelimitedCodec::new()),
			closed: false,
		}
	}

	async fn call(&mut self, req: RpcRequest) -> anyhow::Result<RpcResponse> {
		if self.closed {
			anyhow::bail!("rpc client is closed");
		}
		let bytes = bincode::serialize(&req)?;
		self.framed.send(bytes.into()).await?;
		let frame = self
			.framed
			.next()
			.await
			.ok_or_else(|| anyhow::anyhow!("rpc stream closed by peer"))??;
		Ok(bincode::deserialize(&frame)?)
	}

	/// `register_connection(credentials.auth, tunnel-id, conn-index, options)`.
	pub async fn register_connection(
		&mut self,
		auth: Vec<u8>,
		tunnel_id: Uuid,
		conn_index: u8,
		options: ConnectionOptions,
	) -> Result<ConnectionDetails, RegistrationError> {
		let resp = self
			.call(RpcRequest::RegisterConnection { auth, tunnel_id, conn_index, options })
			.await
			.map_err(|e| RegistrationError::server(true, e))?;
		match resp {
			RpcResponse::Registered(details) => Ok(details),
			RpcResponse::RegisterError { duplicate_connection: true, .. } => Err(RegistrationError::DuplicateConnection),
			RpcResponse::RegisterError { retryable, message, .. } => {
				Err(RegistrationError::server(retryable, anyhow::anyhow!(message)))
			},
			_ => Err(RegistrationError::server(false, anyhow::anyhow!("unexpected rpc response"))),
		}
	}

	/// Best-effort push of the agent's current ingress rules. Counters of
	/// attempts/failures are the caller's responsibility.
	pub async fn send_local_configuration(&mut self, config: Vec<u8>) -> anyhow::Result<()> {
		match self.call(RpcRequest::SendLocalConfiguration { config }).await? {
			RpcResponse::Ack => Ok(()),
			RpcResponse::Error(msg) => anyhow::bail!(msg),
			_ => anyhow::bail!("unexpected rpc response"),
		}
	}

	/// Called with a bounded deadline (the connection's grace period).
	pub async fn unregister_connection(&mut self, deadline: Duration) -> anyhow::Result<()> {
		tokio::time::timeout(deadline, async {
			match self.call(RpcRequest::UnregisterConnection).await? {
				RpcResponse::Ack => Ok(()),
				RpcResponse::Error(msg) => anyhow::bail!(msg),
				_ => anyhow::bail!("unexpected rpc response"),
			}
		})
		.await
		.unwrap_or_else(|_| Err(anyhow::anyhow!("unregister timed out")))
	}

	/// Closes the RPC client and its transport together. Idempotent.
	pub async fn close(&mut self) {
		if self.closed {
			return;
		}
		let _ = self.call(RpcRequest::Close).await;
		self.closed = true;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tunnel_core::BuildInfo;

	fn options() -> ConnectionOptions {
		ConnectionOptions::new(BuildInfo::current(), 0)
	}

	/// Runs a minimal in-process RPC server over a duplex pipe that always
	/// registers successfully, to exercise the client's framing and call
	/// sequencing end to end.
	async fn spawn_happy_server(server_stream: tokio::io::DuplexStream) {
		let mut framed = Framed::new(server_stream, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(Ok(frame)) = framed.next().await {
				let req: RpcRequest = bincode::deserialize(&frame).unwrap();
				let resp = match req {
					RpcRequest::RegisterConnection { .. } => RpcResponse::Registered(ConnectionDetails {
						location: "lhr".to_string(),
						uuid: Uuid::nil(),
						remotely_managed: false,
					}),
					RpcRequest::SendLocalConfiguration { .. } => RpcResponse::Ack,
					RpcRequest::UnregisterConnection => RpcResponse::Ack,
					RpcRequest::Close => RpcResponse::Ack,
				};
				let bytes = bincode::serialize(&resp).unwrap();
				if framed.send(bytes.into()).await.is_err() {
					break;
				}
			}
		});
	}

	#[tokio::test]
	async fn register_round_trips_connection_details() {
		let (client_stream, server_stream) = tokio::io::duplex(4096);
		spawn_happy_server(server_stream).await;
		let mut client = RpcClient::new(client_stream);
		let details = client
			.register_connection(b"secret".to_vec(), Uuid::nil(), 0, options())
			.await
			.unwrap();
		assert_eq!(details.location, "lhr");
	}

	#[tokio::test]
	async fn duplicate_connection_sentinel_is_distinguished() {
		let (client_stream, server_stream) = tokio::io::duplex(4096);
		let mut framed = Framed::new(server_stream, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			if let Some(Ok(_frame)) = framed.next().await {
				let resp = RpcResponse::RegisterError {
					duplicate_connection: true,
					retryable: false,
					message: "EDUPCONN".to_string(),
				};
				let bytes = bincode::serialize(&resp).unwrap();
				let _ = framed.send(bytes.into()).await;
			}
		});
		let mut client = RpcClient::new(client_stream);
		let err = client
			.register_connection(b"secret".to_vec(), Uuid::nil(), 0, options())
			.await
			.unwrap_err();
		assert!(matches!(err, RegistrationError::DuplicateConnection));
	}

	#[tokio::test]
	async fn unregister_honors_deadline() {
		let (client_stream, server_stream) = tokio::io::duplex(4096);
		// Server that reads the request but never responds, keeping the
		// pipe open so the client genuinely waits on the deadline.
		let mut framed = Framed::new(server_stream, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			let _ = framed.next().await;
			tokio::time::sleep(Duration::from_secs(5)).await;
		});
		let mut client = RpcClient::new(client_stream);
		let result = client.unregister_connection(Duration::from_millis(20)).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn close_is_idempotent() {
		let (client_stream, server_stream) = tokio::io::duplex(4096);
		spawn_happy_server(server_stream).await;
		let mut client = RpcClient::new(client_stream);
		client.close().await;
		client.close().await;
		assert!(client.closed);
	}
}
