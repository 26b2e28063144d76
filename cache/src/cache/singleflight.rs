use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Error, SchemaResult};

/// Coalesces concurrent computations for the same key into one.
///
/// The first caller for a key becomes the owner: its computation is spawned
/// as a task and its result is broadcast to every caller that arrived while
/// it was in flight. The owner task always runs to completion, so a caller
/// that gives up waiting (by dropping its future) never strands the others.
/// The computation must not recursively execute the same key, and no
/// timeout is imposed here.
pub(crate) struct Group<K, V> {
    calls: Arc<Mutex<HashMap<K, broadcast::Sender<SchemaResult<V>>>>>,
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Group { calls: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Runs `compute` unless a computation for `key` is already in flight,
    /// in which case the in-flight result is awaited instead. Returns the
    /// result and whether it was shared from another caller's computation.
    pub async fn execute<F>(&self, key: K, compute: F) -> (SchemaResult<V>, bool)
    where
        F: Future<Output = SchemaResult<V>> + Send + 'static,
    {
        let (mut rx, owner) = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    calls.insert(key.clone(), tx.clone());

                    let calls = Arc::clone(&self.calls);
                    tokio::spawn(async move {
                        let result = compute.await;
                        // Remove the cell before publishing so a caller that
                        // arrives after completion starts a fresh flight.
                        calls.lock().remove(&key);
                        let _ = tx.send(result);
                    });
                    (rx, true)
                }
            }
        };

        match rx.recv().await {
            Ok(result) => (result, !owner),
            // The owner vanished without publishing; report cancellation
            // rather than waiting forever.
            Err(_) => (Err(Error::Cancelled), !owner),
        }
    }
}

impl<K, V> Default for Group<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
