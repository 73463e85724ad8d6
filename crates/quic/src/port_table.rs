//! Process-wide index→port table for QUIC source-port reuse.
//!
//! A given connection index reuses its local UDP port across re-dials
//! when possible, so the edge can key on `(ip, port)` across attempts.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static PORT_TABLE: Lazy<Mutex<HashMap<u8, u16>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// The port last recorded for `connection_index`, if any.
pub fn recorded_port(connection_index: u8) -> Option<u16> {
	PORT_TABLE.lock().unwrap().get(&connection_index).copied()
}

/// Records the port actually bound for `connection_index`, overwriting
/// whatever was recorded before (e.g. after falling back to an ephemeral
/// port because the previous one was taken).
pub fn record_port(connection_index: u8, port: u16) {
	PORT_TABLE.lock().unwrap().insert(connection_index, port);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_and_recalls_a_port() {
		// Use an index unlikely to collide with other tests sharing the
		// process-global table.
		record_port(250, 54321);
		assert_eq!(recorded_port(250), Some(54321));
	}

	#[test]
	fn unknown_index_has_no_recorded_port() {
		assert_eq!(recorded_port(251), None);
	}
}
