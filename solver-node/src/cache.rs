//! TTL cache for quotes the solver has signed and published.
//!
//! A fill notification only carries the quote hash, so the solver has to
//! remember which hashes it produced to tell its own fills apart from other
//! solvers' traffic. Entries expire with the quote deadline plus a small
//! grace window; expiry is lazy and piggybacks on inserts and lookups.
use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;
use tracing::trace;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Map from quote hash to the quoted context, with per-entry TTL.
pub struct QuoteCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> QuoteCache<V> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Stores a quote under its hash. Expired entries are swept on the way
    /// in, so the map never grows past the set of live quotes.
    pub fn insert(&self, quote_hash: String, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.expires_at > now);
        trace!(quote_hash, ttl_ms = ttl.as_millis() as u64, "Caching quote");
        entries.insert(quote_hash, Entry { value, expires_at: now + ttl });
    }

    /// Looks up a quote by hash. Entries past their deadline are treated as
    /// absent and dropped.
    pub fn get(&self, quote_hash: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(quote_hash) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(quote_hash);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for QuoteCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
