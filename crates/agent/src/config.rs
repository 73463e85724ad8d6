//! Configuration and credential loading. Both files are plain JSON, loaded
//! once at startup; there is no control-plane API to fetch fresh
//! credentials or to hot-reload this file, that stays out of scope.

use std::path::Path;

use serde::Deserialize;
use uuid::Uuid;

use tunnel_core::Credentials;

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
	/// Edge hostname override; when absent, the transport's own default
	/// (`TransportKind::sni`) is dialed.
	pub edge_hostname: Option<String>,
	/// Base URL prepended to every decoded request's path before it
	/// reaches the origin proxy.
	pub origin_base_url: String,
	#[serde(default)]
	pub features: Vec<String>,
}

impl TunnelConfig {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
		serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
	}
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
	account_tag: String,
	tunnel_id: Uuid,
	/// Base64-encoded tunnel secret, matching the format the edge's
	/// credentials file download already uses.
	tunnel_secret: String,
}

pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
	let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
	let file: CredentialsFile = serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
	let secret = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, file.tunnel_secret)
		.map_err(|e| anyhow::anyhow!("decoding tunnel_secret: {e}"))?;
	Ok(Credentials::new(file.account_tag, file.tunnel_id, secret))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn loads_a_well_formed_config_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, r#"{{"origin_base_url": "http://127.0.0.1:8080", "features": ["foo"]}}"#).unwrap();
		let config = TunnelConfig::load(file.path()).unwrap();
		assert_eq!(config.origin_base_url, "http://127.0.0.1:8080");
		assert_eq!(config.features, vec!["foo".to_string()]);
		assert!(config.edge_hostname.is_none());
	}

	#[test]
	fn loads_and_decodes_credentials() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{"account_tag": "acct", "tunnel_id": "00000000-0000-0000-0000-000000000000", "tunnel_secret": "c2VjcmV0"}}"#
		)
		.unwrap();
		let creds = load_credentials(file.path()).unwrap();
		assert_eq!(creds.account_tag, "acct");
		assert_eq!(creds.secret(), b"secret");
	}
}
