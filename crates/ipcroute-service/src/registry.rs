use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use ipcroute_channel::sync::{read, write};

use crate::service::Handler;

struct Entry {
    handler: Handler,
    count: usize,
}

/// Reference-counted handlers per key.
///
/// Adding a handler that is already registered under a key bumps its count
/// instead of registering it twice. `add` and `remove` report when a key
/// turns non-empty or empty, which is when a remote end has to be told.
pub struct ListenerRegistry<K> {
    entries: RwLock<HashMap<K, Vec<Entry>>>,
}

impl<K: Eq + Hash + Clone> ListenerRegistry<K> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `key`. True if `key` had no handlers before.
    pub fn add(&self, key: K, handler: &Handler) -> bool {
        let mut entries = write(&self.entries);
        let list = entries.entry(key).or_default();
        let first = list.is_empty();
        match list.iter_mut().find(|e| e.handler == *handler) {
            Some(entry) => entry.count += 1,
            None => list.push(Entry {
                handler: handler.clone(),
                count: 1,
            }),
        }
        first
    }

    /// Drop one registration of `handler` under `key`. True if that left
    /// `key` without handlers.
    pub fn remove(&self, key: &K, handler: &Handler) -> bool {
        let mut entries = write(&self.entries);
        let Some(list) = entries.get_mut(key) else {
            return false;
        };
        let Some(index) = list.iter().position(|e| e.handler == *handler) else {
            return false;
        };
        list[index].count -= 1;
        if list[index].count == 0 {
            list.remove(index);
        }
        if list.is_empty() {
            entries.remove(key);
            return true;
        }
        false
    }

    /// Drop every registration under `key`.
    pub fn clear_key(&self, key: &K) -> bool {
        write(&self.entries).remove(key).is_some()
    }

    /// Handlers registered under keys accepted by `filter`, each once per key.
    pub fn matching(&self, filter: impl Fn(&K) -> bool) -> Vec<(K, Handler)> {
        read(&self.entries)
            .iter()
            .filter(|(key, _)| filter(key))
            .flat_map(|(key, list)| list.iter().map(move |e| (key.clone(), e.handler.clone())))
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        read(&self.entries).keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        read(&self.entries).contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for ListenerRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}
