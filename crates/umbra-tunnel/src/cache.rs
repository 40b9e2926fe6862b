//! Correlation caches for in-flight requests.
//!
//! Each cache entry pairs a value with a deadline. Entries are passive:
//! the community drains expired entries on its maintenance tick and runs
//! the matching on-expire action there, so everything stays on the one
//! event loop.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use umbra_wire::StatsMap;

use crate::circuit::{CircuitType, ReadyCallback, RequiredEndpoint};

struct Entry<V> {
    value: V,
    deadline: Instant,
}

/// A keyed correlation cache with per-entry deadlines.
pub struct RequestCache<K, V> {
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Copy, V> RequestCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V, timeout: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                deadline: Instant::now() + timeout,
            },
        );
    }

    pub fn has(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Resolve a request: remove and return its entry.
    pub fn pop(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drain every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(K, V)> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Copy, V> Default for RequestCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters needed to re-issue a failed circuit build.
pub struct CreateParams {
    pub goal_hops: u8,
    pub ctype: CircuitType,
    pub callback: Option<ReadyCallback>,
    pub max_retries: u32,
    pub required_endpoint: Option<RequiredEndpoint>,
    pub info_hash: Option<[u8; 20]>,
}

/// Retry state stored alongside a circuit request.
pub struct RetrySpec {
    pub remaining: u32,
    pub params: CreateParams,
}

/// In-flight `create`/`extend` handshake for a circuit we originated.
/// Expiry while the circuit is not ready tears it down and optionally
/// retries.
pub struct CircuitRequest {
    pub retry: Option<RetrySpec>,
}

/// An accepted `create`, waiting to learn whether we are the exit or a
/// relay. Holds the candidates offered in our `created` reply so a
/// follow-up `extend` can be resolved to an address.
pub struct CreatedRequest {
    pub peer: SocketAddr,
    pub candidates: HashMap<[u8; 32], SocketAddr>,
}

/// An outstanding ping, keyed by its random identifier.
pub struct PingRequest {
    pub circuit_id: u32,
}

/// Handler invoked when a stats response arrives.
pub type StatsHandler = Box<dyn FnOnce(SocketAddr, StatsMap) + Send>;

/// An outstanding stats crawl request.
pub struct StatsRequest {
    pub handler: StatsHandler,
}
