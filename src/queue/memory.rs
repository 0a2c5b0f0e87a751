use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{ListStore, ListStoreError};

/// In-process list store used by tests and local development. Mirrors the
/// redis semantics the queue layer relies on, including argument-order
/// priority for the blocking pop.
#[derive(Clone, Default)]
pub struct MemoryListStore {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	lists: Mutex<HashMap<String, VecDeque<String>>>,
	keys: Mutex<HashMap<String, ExpiringValue>>,
	notify: Notify,
}

struct ExpiringValue {
	value: String,
	expires_at: Option<Instant>,
}

impl ExpiringValue {
	fn is_expired(&self) -> bool {
		self.expires_at.is_some_and(|at| Instant::now() >= at)
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryListStoreError {
	// The memory store has no failure modes today; the variant keeps the
	// error enum shape aligned with the redis backend.
	#[error("poisoned")]
	Poisoned,
}

impl MemoryListStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Test hook: the current value of a plain key, if present and live.
	pub async fn get(&self, key: &str) -> Option<String> {
		let mut keys = self.inner.keys.lock().await;
		match keys.get(key) {
			Some(entry) if entry.is_expired() => {
				keys.remove(key);
				None
			}
			Some(entry) => Some(entry.value.clone()),
			None => None,
		}
	}
}

impl ListStore for MemoryListStore {
	async fn lpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		self.inner
			.lists
			.lock()
			.await
			.entry(key.to_owned())
			.or_default()
			.push_front(value);
		self.inner.notify.notify_waiters();
		Ok(())
	}

	async fn rpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		self.inner
			.lists
			.lock()
			.await
			.entry(key.to_owned())
			.or_default()
			.push_back(value);
		self.inner.notify.notify_waiters();
		Ok(())
	}

	async fn rpop(&self, key: &str) -> Result<Option<String>, ListStoreError> {
		Ok(self.inner.lists.lock().await.get_mut(key).and_then(VecDeque::pop_back))
	}

	async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, String)>, ListStoreError> {
		let deadline = Instant::now() + timeout;

		loop {
			{
				let mut lists = self.inner.lists.lock().await;
				for key in keys {
					if let Some(value) = lists.get_mut(*key).and_then(VecDeque::pop_back) {
						return Ok(Some(((*key).to_owned(), value)));
					}
				}
			}

			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Ok(None);
			}

			let _ = tokio::time::timeout(remaining, self.inner.notify.notified()).await;
		}
	}

	async fn llen(&self, key: &str) -> Result<u64, ListStoreError> {
		Ok(self.inner.lists.lock().await.get(key).map_or(0, VecDeque::len) as u64)
	}

	async fn lrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, ListStoreError> {
		Ok(self
			.inner
			.lists
			.lock()
			.await
			.get(key)
			.map(|list| list.iter().skip(offset).take(limit).cloned().collect())
			.unwrap_or_default())
	}

	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ListStoreError> {
		let mut keys = self.inner.keys.lock().await;

		if keys.get(key).is_some_and(|entry| !entry.is_expired()) {
			return Ok(false);
		}

		keys.insert(
			key.to_owned(),
			ExpiringValue {
				value: value.to_owned(),
				expires_at: Some(Instant::now() + ttl),
			},
		);
		Ok(true)
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ListStoreError> {
		if let Some(entry) = self.inner.keys.lock().await.get_mut(key) {
			entry.expires_at = Some(Instant::now() + ttl);
		}
		Ok(())
	}

	async fn del(&self, key: &str) -> Result<(), ListStoreError> {
		self.inner.keys.lock().await.remove(key);
		self.inner.lists.lock().await.remove(key);
		Ok(())
	}

	async fn healthy(&self) -> bool {
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn brpop_times_out_on_empty_store() {
		let store = MemoryListStore::new();
		let popped = store.brpop(&["a", "b"], Duration::from_millis(50)).await.expect("brpop");
		assert_eq!(popped, None);
	}

	#[tokio::test]
	async fn brpop_wakes_on_push() {
		let store = MemoryListStore::new();

		let waiter = tokio::spawn({
			let store = store.clone();
			async move { store.brpop(&["a"], Duration::from_secs(5)).await }
		});

		tokio::time::sleep(Duration::from_millis(20)).await;
		store.lpush("a", "x".into()).await.expect("push");

		let popped = waiter.await.expect("join").expect("brpop");
		assert_eq!(popped, Some(("a".into(), "x".into())));
	}

	#[tokio::test]
	async fn lock_is_exclusive_until_expiry() {
		let store = MemoryListStore::new();

		assert!(store.set_nx_ex("lock", "a", Duration::from_millis(40)).await.expect("set"));
		assert!(!store.set_nx_ex("lock", "b", Duration::from_millis(40)).await.expect("set"));

		tokio::time::sleep(Duration::from_millis(60)).await;
		assert!(store.set_nx_ex("lock", "c", Duration::from_millis(40)).await.expect("set"));
	}

	#[tokio::test]
	async fn del_releases_lock() {
		let store = MemoryListStore::new();
		assert!(store.set_nx_ex("lock", "a", Duration::from_secs(30)).await.expect("set"));
		store.del("lock").await.expect("del");
		assert!(store.set_nx_ex("lock", "b", Duration::from_secs(30)).await.expect("set"));
	}
}
