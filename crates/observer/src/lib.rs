//! Observer / event fabric: fans lifecycle events out from every
//! active connection to a set of registered sinks, and rolls the same
//! events up into process-wide metrics.
//!
//! The observer is a singleton owned by the root task, not an
//! ambient global: callers hold an `Arc<Observer>` and pass it down to
//! whichever connection needs to publish.

pub mod event;
pub mod metrics;

use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

pub use event::{Event, IndexedEvent};
pub use metrics::ObserverMetrics;

/// A subscriber notified of every event, in the order `Observer` dispatches
/// them. Sinks run on a single dispatcher task in registration order: a
/// slow sink slows every sink behind it but cannot deadlock producers,
/// which only ever try-send into a bounded queue.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
	async fn on_event(&self, event: IndexedEvent);
}

/// Bounded so a stuck sink can't grow memory without bound; producers drop
/// and log rather than block.
const QUEUE_CAPACITY: usize = 16;

pub struct Observer {
	tx: mpsc::Sender<IndexedEvent>,
	sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
	pub metrics: Arc<ObserverMetrics>,
}

impl Observer {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
		let sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>> = Arc::new(RwLock::new(Vec::new()));
		let metrics = Arc::new(ObserverMetrics::new());

		tokio::spawn(dispatch_loop(rx, sinks.clone(), metrics.clone()));

		Observer { tx, sinks, metrics }
	}

	pub fn register_metrics(&self, registry: &mut Registry) {
		self.metrics.register(registry);
	}

	pub async fn register_sink(&self, sink: Arc<dyn EventSink>) {
		self.sinks.write().await.push(sink);
	}

	pub fn record_local_config_push(&self) {
		self.metrics.record_local_config_push();
	}

	pub fn record_user_hostname(&self, hostname: &str) {
		self.metrics.record_user_hostname(hostname);
	}

	/// Non-blocking. Drops and logs if the queue is full rather than
	/// backpressuring the connection that produced the event.
	pub fn publish(&self, connection_index: u8, event: Event) {
		let indexed = IndexedEvent { connection_index, event };
		if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(indexed) {
			warn!(connection_index = dropped.connection_index, "observer queue full, dropping event");
		}
	}
}

impl Default for Observer {
	fn default() -> Self {
		Self::new()
	}
}

async fn dispatch_loop(mut rx: mpsc::Receiver<IndexedEvent>, sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>, metrics: Arc<ObserverMetrics>) {
	while let Some(indexed) = rx.recv().await {
		apply_metrics(&metrics, &indexed);

		let snapshot = sinks.read().await.clone();
		for sink in snapshot {
			sink.on_event(indexed.clone()).await;
		}
	}
}

fn apply_metrics(metrics: &ObserverMetrics, indexed: &IndexedEvent) {
	match &indexed.event {
		Event::RegisteringTunnel => {}
		Event::Connected { location, .. } => {
			metrics.set_location(indexed.connection_index, location);
			metrics.record_registration("success");
		}
		Event::Reconnecting => {}
		Event::SetUrl(_) => {}
		Event::Unregistering => {}
		Event::Disconnected => {
			metrics.clear_location(indexed.connection_index);
		}
		Event::RegistrationFailed { .. } => {
			metrics.record_registration("failure");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{IpAddr, Ipv4Addr};
	use std::sync::Mutex;
	use tunnel_transport::TransportKind;

	struct RecordingSink {
		seen: Arc<Mutex<Vec<IndexedEvent>>>,
	}

	#[async_trait::async_trait]
	impl EventSink for RecordingSink {
		async fn on_event(&self, event: IndexedEvent) {
			self.seen.lock().unwrap().push(event);
		}
	}

	#[tokio::test]
	async fn dispatches_in_registration_order_across_two_sinks() {
		let observer = Observer::new();
		let seen_a = Arc::new(Mutex::new(Vec::new()));
		let seen_b = Arc::new(Mutex::new(Vec::new()));
		observer.register_sink(Arc::new(RecordingSink { seen: seen_a.clone() })).await;
		observer.register_sink(Arc::new(RecordingSink { seen: seen_b.clone() })).await;

		observer.publish(0, Event::RegisteringTunnel);
		observer.publish(0, Event::Connected {
			protocol: TransportKind::Quic,
			location: "SJC".to_string(),
			edge_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
		});

		// give the dispatcher a chance to drain
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		assert_eq!(seen_a.lock().unwrap().len(), 2);
		assert_eq!(seen_b.lock().unwrap().len(), 2);
		assert_eq!(seen_a.lock().unwrap()[0].event, Event::RegisteringTunnel);
	}

	#[tokio::test]
	async fn seventeenth_pending_event_is_dropped_without_blocking() {
		// A sink that never returns keeps the dispatcher from draining the
		// queue, so publishes pile up behind it.
		struct BlockingSink;
		#[async_trait::async_trait]
		impl EventSink for BlockingSink {
			async fn on_event(&self, _event: IndexedEvent) {
				std::future::pending::<()>().await;
			}
		}

		let observer = Observer::new();
		observer.register_sink(Arc::new(BlockingSink)).await;

		// First publish is picked up by the dispatcher immediately and
		// blocks it forever inside BlockingSink; the channel itself then
		// fills up from the remaining 16 publishes.
		for _ in 0..17 {
			observer.publish(0, Event::Reconnecting);
		}
		// None of the 17 publish() calls above blocked; try_send is
		// synchronous and this test would hang on the first overflow
		// otherwise. Reaching here is the assertion.
	}

	#[tokio::test]
	async fn connected_then_disconnected_clears_location_gauge() {
		let observer = Observer::new();
		observer.publish(5, Event::Connected {
			protocol: TransportKind::Http2,
			location: "LAX".to_string(),
			edge_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
		});
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		assert_eq!(
			observer.metrics.connections_by_location.get_or_create(&metrics::LocationLabels { location: "LAX".to_string() }).get(),
			1
		);

		observer.publish(5, Event::Disconnected);
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		assert_eq!(
			observer.metrics.connections_by_location.get_or_create(&metrics::LocationLabels { location: "LAX".to_string() }).get(),
			0
		);
	}
}
