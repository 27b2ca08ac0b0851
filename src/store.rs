//! Last-writer-wins key-value store. No tombstones: a value is overwritten,
//! never deleted.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

/// Sentinel returned for a missing key, matching the stream protocol's
/// `<nil>` literal.
pub const NIL: &str = "<nil>";

struct Entry {
    ts: Instant,
    value: String,
}

pub struct Store {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Applies a write with the local-monotonic timestamp captured at the
    /// moment of apply. A write whose `ts` is older than what's stored is
    /// dropped silently (last-writer-wins).
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.put_at(key, value, Instant::now())
    }

    fn put_at(&self, key: impl Into<String>, value: impl Into<String>, ts: Instant) {
        let mut entries = self.entries.lock().unwrap();
        let key = key.into();
        match entries.get(&key) {
            Some(existing) if existing.ts > ts => {}
            _ => {
                entries.insert(key, Entry { ts, value: value.into() });
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).map(|e| e.value.clone())
    }

    pub fn get_or_nil(&self, key: &str) -> String {
        self.get(key).unwrap_or_else(|| NIL.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_returns_nil() {
        let store = Store::new();
        assert_eq!(store.get_or_nil("color"), NIL);
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = Store::new();
        store.put("color", "blue");
        assert_eq!(store.get("color").as_deref(), Some("blue"));
    }

    #[test]
    fn later_write_overwrites_earlier() {
        let store = Store::new();
        store.put("color", "blue");
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.put("color", "red");
        assert_eq!(store.get("color").as_deref(), Some("red"));
    }

    #[test]
    fn stale_write_is_dropped() {
        let store = Store::new();
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_millis(10);
        store.put_at("k", "newer", t1);
        store.put_at("k", "stale", t0);
        assert_eq!(store.get("k").as_deref(), Some("newer"));
    }
}
