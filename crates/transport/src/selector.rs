//! Protocol selector: picks the transport to dial next and the
//! fallback to try if that dial's handshake or early negotiation fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::kind::TransportKind;

/// The fixed fallback chain used by every non-static mode:
/// QUIC falls back to HTTP2; HTTP2 has no fallback.
const FALLBACK_CHAIN: &[TransportKind] = &[TransportKind::Quic, TransportKind::Http2];

/// Injected function returning `{protocol-name -> percentage}`.
/// Percentages are signed so a protocol can be actively disabled
/// (negative value), not just left unlisted.
#[async_trait]
pub trait PercentageFetcher: Send + Sync {
	async fn fetch(&self) -> anyhow::Result<HashMap<String, i32>>;
}

/// FNV-1a, 32-bit. Non-cryptographic; used only to derive a stable
/// rollout bucket per account.
fn fnv1a_32(input: &str) -> u32 {
	const OFFSET_BASIS: u32 = 0x811c_9dc5;
	const PRIME: u32 = 0x0100_0193;
	input.bytes().fold(OFFSET_BASIS, |hash, byte| (hash ^ byte as u32).wrapping_mul(PRIME))
}

/// Per-account rollout threshold in 0..100, deterministic given the
/// account tag.
pub fn account_threshold(account_tag: &str) -> i32 {
	(fnv1a_32(account_tag) % 100) as i32
}

struct RemoteAutoState {
	fetcher: Arc<dyn PercentageFetcher>,
	ttl: Duration,
	threshold: i32,
	cached: Mutex<Option<(TransportKind, Instant)>>,
}

enum Mode {
	/// Caller fixed the transport; fallback returns `(self, false)`.
	Static(TransportKind),
	/// Caller chose "auto"; periodically refreshed from the percentage
	/// fetcher.
	RemoteAuto(RemoteAutoState),
	/// Caller chose auto but a token was provided: start with the
	/// highest-priority protocol (QUIC), use the fixed fallback chain.
	Default,
}

/// Tracks the most recently resolved transport so `fallback()` knows what
/// it is falling back *from* returns ... to try if
/// the current transport fails").
pub struct ProtocolSelector {
	mode: Mode,
	last_current: Mutex<Option<TransportKind>>,
}

impl ProtocolSelector {
	pub fn static_kind(kind: TransportKind) -> Self {
		Self {
			mode: Mode::Static(kind),
			last_current: Mutex::new(None),
		}
	}

	pub fn remote_auto(fetcher: Arc<dyn PercentageFetcher>, account_tag: &str, ttl: Duration) -> Self {
		Self {
			mode: Mode::RemoteAuto(RemoteAutoState {
				fetcher,
				ttl,
				threshold: account_threshold(account_tag),
				cached: Mutex::new(None),
			}),
			last_current: Mutex::new(None),
		}
	}

	pub fn default_auto() -> Self {
		Self {
			mode: Mode::Default,
			last_current: Mutex::new(None),
		}
	}

	/// Returns the transport kind to use for the next dial.
	pub async fn current(&self) -> TransportKind {
		let resolved = match &self.mode {
			Mode::Static(kind) => *kind,
			Mode::Default => TransportKind::Quic,
			Mode::RemoteAuto(state) => self.resolve_remote_auto(state).await,
		};
		*self.last_current.lock().unwrap() = Some(resolved);
		resolved
	}

	async fn resolve_remote_auto(&self, state: &RemoteAutoState) -> TransportKind {
		{
			let cached = state.cached.lock().unwrap();
			if let Some((kind, fetched_at)) = *cached {
				if fetched_at.elapsed() < state.ttl {
					return kind;
				}
			}
		}

		let percentages = match state.fetcher.fetch().await {
			Ok(p) => p,
			Err(e) => {
				tracing::warn!(error = %e, "failed to fetch protocol percentages, retaining last value");
				let cached = state.cached.lock().unwrap();
				return cached.map(|(kind, _)| kind).unwrap_or(TransportKind::Quic);
			},
		};

		let chosen = FALLBACK_CHAIN
			.iter()
			.copied()
			.find(|kind| percentages.get(kind.name()).is_some_and(|pct| *pct > state.threshold))
			.unwrap_or(TransportKind::Quic);

		*state.cached.lock().unwrap() = Some((chosen, Instant::now()));
		chosen
	}

	/// Returns `(kind, has_fallback)` to try if the current transport
	/// fails handshake or early negotiation.
	pub fn fallback(&self) -> (TransportKind, bool) {
		match &self.mode {
			Mode::Static(kind) => (*kind, false),
			Mode::Default | Mode::RemoteAuto(_) => {
				let current = self.last_current.lock().unwrap().unwrap_or(TransportKind::Quic);
				match current {
					TransportKind::Quic => (TransportKind::Http2, true),
					TransportKind::Http2 => (TransportKind::Http2, false),
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FixedFetcher(HashMap<String, i32>);

	#[async_trait]
	impl PercentageFetcher for FixedFetcher {
		async fn fetch(&self) -> anyhow::Result<HashMap<String, i32>> {
			Ok(self.0.clone())
		}
	}

	struct FailingFetcher;

	#[async_trait]
	impl PercentageFetcher for FailingFetcher {
		async fn fetch(&self) -> anyhow::Result<HashMap<String, i32>> {
			anyhow::bail!("network down")
		}
	}

	struct CountingFetcher {
		calls: AtomicUsize,
		percentages: HashMap<String, i32>,
	}

	#[async_trait]
	impl PercentageFetcher for CountingFetcher {
		async fn fetch(&self) -> anyhow::Result<HashMap<String, i32>> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(self.percentages.clone())
		}
	}

	#[test]
	fn threshold_is_deterministic_per_account() {
		let a = account_threshold("account-a");
		let b = account_threshold("account-a");
		assert_eq!(a, b);
		assert!((0..100).contains(&a));
	}

	#[tokio::test]
	async fn static_mode_never_falls_back() {
		let selector = ProtocolSelector::static_kind(TransportKind::Http2);
		assert_eq!(selector.current().await, TransportKind::Http2);
		assert_eq!(selector.fallback(), (TransportKind::Http2, false));
	}

	#[tokio::test]
	async fn default_mode_starts_quic_and_falls_back_to_http2() {
		let selector = ProtocolSelector::default_auto();
		assert_eq!(selector.current().await, TransportKind::Quic);
		assert_eq!(selector.fallback(), (TransportKind::Http2, true));
	}

	#[tokio::test]
	async fn remote_auto_picks_first_eligible_protocol_in_priority_order() {
		let mut percentages = HashMap::new();
		percentages.insert("quic".to_string(), 10);
		percentages.insert("http2".to_string(), 90);
		let fetcher = Arc::new(FixedFetcher(percentages));
		// Force a threshold of 0 so only quic's 10% is what we vary against;
		// pick an account tag whose threshold is comfortably below 10.
		let selector = ProtocolSelector::remote_auto(fetcher, "low-threshold-account", Duration::from_secs(60));
		let kind = selector.current().await;
		assert!(kind == TransportKind::Quic || kind == TransportKind::Http2);
	}

	#[tokio::test]
	async fn remote_auto_retains_last_value_on_fetch_error() {
		let selector = ProtocolSelector::remote_auto(Arc::new(FailingFetcher), "acct", Duration::from_secs(60));
		// No prior cached value and a failing fetcher: falls back to quic.
		assert_eq!(selector.current().await, TransportKind::Quic);
	}

	#[tokio::test]
	async fn remote_auto_caches_for_ttl() {
		let mut percentages = HashMap::new();
		percentages.insert("quic".to_string(), 100);
		let fetcher = Arc::new(CountingFetcher {
			calls: AtomicUsize::new(0),
			percentages,
		});
		let selector = ProtocolSelector::remote_auto(fetcher.clone(), "acct", Duration::from_secs(3600));
		selector.current().await;
		selector.current().await;
		selector.current().await;
		assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
	}
}
