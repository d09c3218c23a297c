//! Observable containers mirrored across executors.
//!
//! The engine owns an [`ObservableMap`] and mutates it from its event loop;
//! HTTP handlers and the CLI consume [`Mirror`]s, which apply the emitted
//! deltas on their own executor and can be read without ever blocking the
//! writer. The initial snapshot is taken synchronously while subscribing, so
//! a mirror observes every change exactly once and in order.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

/// A single change to an observable map.
#[derive(Debug, Clone)]
pub enum MapDelta<K, V> {
    Added(K, V),
    Removed(K),
    Replaced(K, V),
}

/// Writer-owned map that publishes every mutation to its mirrors.
pub struct ObservableMap<K, V> {
    inner: HashMap<K, V>,
    subscribers: Vec<mpsc::UnboundedSender<MapDelta<K, V>>>,
}

impl<K, V> Default for ObservableMap<K, V> {
    fn default() -> Self {
        Self { inner: HashMap::new(), subscribers: Vec::new() }
    }
}

impl<K, V> ObservableMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: K, value: V) {
        let delta = match self.inner.insert(key.clone(), value.clone()) {
            Some(_) => MapDelta::Replaced(key, value),
            None => MapDelta::Added(key, value),
        };
        self.publish(delta);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.inner.remove(key);
        if removed.is_some() {
            self.publish(MapDelta::Removed(key.clone()));
        }
        removed
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    fn publish(&mut self, delta: MapDelta<K, V>) {
        // Dropped mirrors unsubscribe implicitly.
        self.subscribers.retain(|tx| tx.send(delta.clone()).is_ok());
    }

    /// Create a mirror applying deltas on the current tokio runtime.
    pub fn mirror(&mut self) -> Mirror<K, V> {
        self.mirror_on(&tokio::runtime::Handle::current())
    }

    /// Create a mirror whose delta-applying task runs on `handle`.
    pub fn mirror_on(&mut self, handle: &tokio::runtime::Handle) -> Mirror<K, V> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Snapshot while we still hold the writer: deltas queued behind the
        // snapshot are applied on top of it, never twice.
        let snapshot = Arc::new(RwLock::new(self.inner.clone()));
        self.subscribers.push(tx);

        let applied = Arc::clone(&snapshot);
        handle.spawn(async move {
            while let Some(delta) = rx.recv().await {
                let mut map = applied.write().expect("mirror lock poisoned");
                match delta {
                    MapDelta::Added(k, v) | MapDelta::Replaced(k, v) => {
                        map.insert(k, v);
                    }
                    MapDelta::Removed(k) => {
                        map.remove(&k);
                    }
                }
            }
        });
        Mirror { snapshot }
    }
}

/// Read-only copy of an [`ObservableMap`], kept current by a background task.
#[derive(Clone)]
pub struct Mirror<K, V> {
    snapshot: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Mirror<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot.read().expect("mirror lock poisoned").get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.snapshot.read().expect("mirror lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().expect("mirror lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirror_sees_snapshot_and_deltas_in_order() {
        let mut map: ObservableMap<u32, &'static str> = ObservableMap::new();
        map.insert(1, "one");
        let mirror = map.mirror();
        assert_eq!(mirror.get(&1), Some("one"));

        map.insert(2, "two");
        map.insert(1, "uno");
        map.remove(&2);
        // Let the mirror task drain its queue.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(mirror.get(&1), Some("uno"));
        assert_eq!(mirror.get(&2), None);
    }
}
