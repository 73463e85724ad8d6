//! Immutable configuration consumed by the control stream.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// {account-tag, tunnel-id, tunnel-secret}. Produced once at process
/// startup, read-only afterwards. `tunnel_secret` is never logged: `Debug`
/// redacts it and it does not derive `serde::Serialize`.
#[derive(Clone)]
pub struct Credentials {
	pub account_tag: String,
	pub tunnel_id: Uuid,
	tunnel_secret: Arc<[u8]>,
}

impl Credentials {
	pub fn new(account_tag: impl Into<String>, tunnel_id: Uuid, tunnel_secret: Vec<u8>) -> Self {
		Self {
			account_tag: account_tag.into(),
			tunnel_id,
			tunnel_secret: Arc::from(tunnel_secret),
		}
	}

	/// The raw secret bytes, for handing to the RPC client at register
	/// time. Callers must not log this.
	pub fn secret(&self) -> &[u8] {
		&self.tunnel_secret
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("account_tag", &self.account_tag)
			.field("tunnel_id", &self.tunnel_id)
			.field("tunnel_secret", &"<redacted>")
			.finish()
	}
}

/// Agent build identity, sent as part of [`ConnectionOptions`] at
/// registration.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildInfo {
	pub product: String,
	pub version: String,
}

impl BuildInfo {
	pub fn current() -> Self {
		Self {
			product: "tunneld".to_string(),
			version: env!("CARGO_PKG_VERSION").to_string(),
		}
	}
}

/// {credentials, client-info, optional quick-tunnel-url}. Lifecycle =
/// process lifetime.
#[derive(Clone, Debug)]
pub struct TunnelProperties {
	pub credentials: Credentials,
	pub client_info: BuildInfo,
	pub quick_tunnel_url: Option<String>,
}

/// A snapshot the core sends at registration time. The
/// supervisor may keep mutating whatever it built this from; each
/// registration call takes a frozen `Clone` of the options current at that
/// moment, so later supervisor mutation can never be observed mid-RPC.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ConnectionOptions {
	pub client: BuildInfo,
	pub features: Vec<String>,
	/// 0..N-1, unique within the supervisor's current set.
	pub connection_index: u8,
	pub num_previous_attempts: Option<u32>,
}

impl ConnectionOptions {
	pub fn new(client: BuildInfo, connection_index: u8) -> Self {
		Self {
			client,
			features: Vec::new(),
			connection_index,
			num_previous_attempts: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn credentials_debug_redacts_secret() {
		let creds = Credentials::new("act", Uuid::nil(), b"super-secret".to_vec());
		let out = format!("{creds:?}");
		assert!(!out.contains("super-secret"));
		assert!(out.contains("redacted"));
	}

	#[test]
	fn connection_options_is_a_frozen_snapshot() {
		let mut opts = ConnectionOptions::new(BuildInfo::current(), 3);
		let snapshot = opts.clone();
		opts.connection_index = 4;
		opts.num_previous_attempts = Some(2);
		assert_eq!(snapshot.connection_index, 3);
		assert_eq!(snapshot.num_previous_attempts, None);
	}
}
