//! Command-line surface for `tunneld`: enough to exercise the connection
//! core against a real edge without pulling in the full supervisor CLI
//! (`cloudflared tunnel run`'s config-file precedence, named tunnels, DNS
//! routing, and the rest stay out of scope).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tunneld", about = "Edge-tunnel connection agent")]
pub struct Cli {
	/// Path to the tunnel's JSON configuration file.
	#[arg(long, default_value = "tunnel.json")]
	pub config: PathBuf,

	/// Path to the JSON credentials file (account tag, tunnel id, secret).
	#[arg(long, default_value = "credentials.json")]
	pub credentials: PathBuf,

	/// Forces a single transport instead of the default QUIC-first,
	/// HTTP2-fallback auto selection. One of "quic", "http2".
	#[arg(long)]
	pub protocol: Option<String>,

	/// Number of concurrent connections to the edge.
	#[arg(long, default_value_t = 4)]
	pub connections: u8,

	/// Default `tracing` filter directive, overridden by `RUST_LOG`.
	#[arg(long, default_value = "tunneld=info,tunnel_quic=info,tunnel_h2=info")]
	pub log_level: String,

	/// Grace period given to the edge's `unregister_connection` RPC before
	/// the process tears the connection down unconditionally.
	#[arg(long, default_value_t = 30)]
	pub grace_period_secs: u64,
}
