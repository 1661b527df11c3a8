//! In-memory key-value store backing the RESP command set.
//!
//! Process-wide `String -> bytes` map behind a single `RwLock`, shared by
//! every RESP connection. Values are binary-safe; keys arrive as bulk
//! strings and are stored lossily decoded.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::trace;

pub struct Store {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl Store {
    pub fn new() -> Arc<Store> {
        Arc::new(Store {
            data: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Vec<u8>) {
        trace!(key, len = value.len(), "set");
        self.data.write().unwrap().insert(key.to_string(), value);
    }

    /// Returns true if the key existed.
    pub fn delete(&self, key: &str) -> bool {
        self.data.write().unwrap().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let store = Store::new();
        assert!(store.get("k").is_none());

        store.set("k", b"value".to_vec());
        assert_eq!(store.get("k").unwrap(), b"value");
        assert_eq!(store.len(), 1);

        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.is_empty());
    }

    #[test]
    fn overwrite_replaces_value() {
        let store = Store::new();
        store.set("k", b"one".to_vec());
        store.set("k", b"two".to_vec());
        assert_eq!(store.get("k").unwrap(), b"two");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keys_returns_all() {
        let store = Store::new();
        store.set("a", vec![1]);
        store.set("b", vec![2]);
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn concurrent_access() {
        let store = Store::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let key = format!("key-{i}");
                    store.set(&key, vec![i as u8]);
                    assert_eq!(store.get(&key).unwrap(), vec![i as u8]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
