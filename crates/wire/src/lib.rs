//! Wire-level machinery shared by the H2 and QUIC connections: the header
//! codec, the response writer, and the framed RPC
//! client used by the control stream.

pub mod ack;
pub mod header_codec;
pub mod response_writer;
pub mod rpc;

pub use ack::SharedAck;
pub use header_codec::{DecodedRequest, HeaderCodecError, ResponseSource};
pub use response_writer::{HeaderSink, ResponseWriter, ResponseWriterError};
pub use rpc::{ConnectionDetails, RpcClient};

/// Wire shape of a `ConfigurationUpdate` stream's body: `{"version": ...,
/// "config": ...}` in both the H2 (JSON body) and QUIC (bincode-framed)
/// transports.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigUpdateRequest {
	pub version: i32,
	pub config: serde_json::Value,
}

/// Wire shape of the reply: `{"lastAppliedVersion": ..., "err": ...}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigUpdateResponse {
	#[serde(rename = "lastAppliedVersion")]
	pub last_applied_version: i32,
	pub err: Option<String>,
}
