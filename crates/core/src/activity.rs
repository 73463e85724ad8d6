//! The per-connection activity barrier (spec.md §3, §4.F, §5, §8): every
//! accepted request increments it on entry and decrements it on exit, and
//! the connection's close path blocks until it drains back to zero so that
//! no in-flight request is dropped out from under its stream.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts in-flight requests on one connection. Cloned cheaply via `Arc`
/// and shared between the connection's `serve()` loop and every spawned
/// per-stream dispatch task.
pub struct ActivityBarrier {
	count: AtomicUsize,
	idle: Notify,
}

impl ActivityBarrier {
	pub fn new() -> Self {
		ActivityBarrier { count: AtomicUsize::new(0), idle: Notify::new() }
	}

	/// Marks one request as accepted. The returned guard decrements the
	/// counter on drop, regardless of whether the request's task panics,
	/// errors, or completes normally. Takes the barrier's own `Arc` handle
	/// (rather than `&self`) so the guard can outlive the call site.
	pub fn enter(barrier: &std::sync::Arc<Self>) -> ActivityGuard {
		barrier.count.fetch_add(1, Ordering::SeqCst);
		ActivityGuard { barrier: barrier.clone() }
	}

	pub fn active_count(&self) -> usize {
		self.count.load(Ordering::SeqCst)
	}

	/// Resolves once the barrier has drained to zero. Safe to call
	/// repeatedly; a barrier that never had any entries resolves
	/// immediately.
	pub async fn wait_idle(&self) {
		loop {
			if self.count.load(Ordering::SeqCst) == 0 {
				return;
			}
			self.idle.notified().await;
			// Re-check: a notification can race a concurrent `enter()`
			// that bumped the count back up between the load above and
			// `notified()` firing.
		}
	}
}

pub struct ActivityGuard {
	barrier: std::sync::Arc<ActivityBarrier>,
}

impl Drop for ActivityGuard {
	fn drop(&mut self) {
		if self.barrier.count.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.barrier.idle.notify_waiters();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::time::Duration;

	#[tokio::test]
	async fn idle_immediately_with_no_entries() {
		let barrier = Arc::new(ActivityBarrier::new());
		tokio::time::timeout(Duration::from_millis(50), barrier.wait_idle()).await.expect("should not block");
	}

	#[tokio::test]
	async fn wait_idle_blocks_until_guard_drops() {
		let barrier = Arc::new(ActivityBarrier::new());
		let guard = ActivityBarrier::enter(&barrier);
		assert_eq!(barrier.active_count(), 1);

		let waiter_barrier = barrier.clone();
		let waiter = tokio::spawn(async move { waiter_barrier.wait_idle().await });

		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!waiter.is_finished());

		drop(guard);
		tokio::time::timeout(Duration::from_millis(200), waiter).await.expect("waiter should finish").unwrap();
	}

	#[tokio::test]
	async fn multiple_entries_all_must_drop() {
		let barrier = Arc::new(ActivityBarrier::new());
		let g1 = ActivityBarrier::enter(&barrier);
		let g2 = ActivityBarrier::enter(&barrier);
		assert_eq!(barrier.active_count(), 2);
		drop(g1);
		assert_eq!(barrier.active_count(), 1);
		drop(g2);
		assert_eq!(barrier.active_count(), 0);
	}
}
