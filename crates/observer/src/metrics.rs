//! Metric families published by the observer: one gauge per
//! edge location currently in use, plus counters for registration outcomes,
//! user hostnames, and local-configuration pushes. Registered the same way
//! `tunnel_core::metrics::TokioCollector` registers itself: the caller owns
//! the [`Registry`] and calls [`ObserverMetrics::register`] once.

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct LocationLabels {
	pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RegistrationLabels {
	pub outcome: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct HostnameLabels {
	pub hostname: String,
}

/// Tracks per-metric state the observer needs beyond what `prometheus_client`
/// gives you for free: moving a connection between edge locations must
/// decrement the old label and increment the new one, which means
/// remembering what the old label was.
pub struct ObserverMetrics {
	pub(crate) connections_by_location: Family<LocationLabels, Gauge>,
	pub(crate) registration_outcomes: Family<RegistrationLabels, Counter>,
	pub(crate) user_hostnames: Family<HostnameLabels, Counter>,
	pub(crate) local_config_pushes: Counter,
	current_location: Mutex<HashMap<u8, String>>,
}

impl ObserverMetrics {
	pub fn new() -> Self {
		ObserverMetrics {
			connections_by_location: Family::default(),
			registration_outcomes: Family::default(),
			user_hostnames: Family::default(),
			local_config_pushes: Counter::default(),
			current_location: Mutex::new(HashMap::new()),
		}
	}

	pub fn register(&self, registry: &mut Registry) {
		registry.register(
			"tunnel_connections_by_location",
			"number of active connections per edge location",
			self.connections_by_location.clone(),
		);
		registry.register(
			"tunnel_registration_outcomes",
			"registration attempts by outcome",
			self.registration_outcomes.clone(),
		);
		registry.register(
			"tunnel_user_hostnames",
			"requests observed per configured hostname",
			self.user_hostnames.clone(),
		);
		registry.register(
			"tunnel_local_config_pushes",
			"number of local configuration pushes sent over the control stream",
			self.local_config_pushes.clone(),
		);
	}

	/// Moves `connection_index`'s gauge contribution from its previously
	/// recorded location (if any) to `location`.
	pub(crate) fn set_location(&self, connection_index: u8, location: &str) {
		let mut current = self.current_location.lock().unwrap();
		if let Some(old) = current.get(&connection_index) {
			if old == location {
				return;
			}
			self.connections_by_location.get_or_create(&LocationLabels { location: old.clone() }).dec();
		}
		self.connections_by_location.get_or_create(&LocationLabels { location: location.to_string() }).inc();
		current.insert(connection_index, location.to_string());
	}

	/// Removes `connection_index`'s contribution entirely, e.g. on
	/// disconnect.
	pub(crate) fn clear_location(&self, connection_index: u8) {
		let mut current = self.current_location.lock().unwrap();
		if let Some(old) = current.remove(&connection_index) {
			self.connections_by_location.get_or_create(&LocationLabels { location: old }).dec();
		}
	}

	pub(crate) fn record_registration(&self, outcome: &'static str) {
		self.registration_outcomes.get_or_create(&RegistrationLabels { outcome }).inc();
	}

	pub(crate) fn record_local_config_push(&self) {
		self.local_config_pushes.inc();
	}

	pub(crate) fn record_user_hostname(&self, hostname: &str) {
		self.user_hostnames.get_or_create(&HostnameLabels { hostname: hostname.to_string() }).inc();
	}
}

impl Default for ObserverMetrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn moving_location_decrements_old_and_increments_new() {
		let m = ObserverMetrics::new();
		m.set_location(0, "SJC");
		assert_eq!(m.connections_by_location.get_or_create(&LocationLabels { location: "SJC".to_string() }).get(), 1);

		m.set_location(0, "LAX");
		assert_eq!(m.connections_by_location.get_or_create(&LocationLabels { location: "SJC".to_string() }).get(), 0);
		assert_eq!(m.connections_by_location.get_or_create(&LocationLabels { location: "LAX".to_string() }).get(), 1);
	}

	#[test]
	fn setting_same_location_twice_is_a_no_op() {
		let m = ObserverMetrics::new();
		m.set_location(0, "SJC");
		m.set_location(0, "SJC");
		assert_eq!(m.connections_by_location.get_or_create(&LocationLabels { location: "SJC".to_string() }).get(), 1);
	}

	#[test]
	fn clearing_location_decrements_it() {
		let m = ObserverMetrics::new();
		m.set_location(3, "SJC");
		m.clear_location(3);
		assert_eq!(m.connections_by_location.get_or_create(&LocationLabels { location: "SJC".to_string() }).get(), 0);
	}
}
