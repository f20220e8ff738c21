//! The answer cache.
//!
//! The resolver treats its cache as an opaque asynchronous key/value store
//! through the [`Cache`] trait. Keys combine the lowercased name and the
//! record type; values are answer sequences. A proven absence of records is
//! an ordinary entry with an empty sequence and [`NEGATIVE_TTL`].
//!
//! [`MemoryCache`] is the default backend. Backends with other lifetimes,
//! shared memory or a network cache, can be dropped in through the trait.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use crate::answer::Answer;
use crate::base::iana::Rtype;

/// TTL of negative cache entries, per RFC 2308.
pub const NEGATIVE_TTL: u32 = 300;

/// Upper bound on entries held by the default backend.
const MAX_CACHE_ENTRIES: u64 = 10_000;

/// Builds the cache key for a lowercased name and a record type.
pub fn cache_key(name: &str, rtype: Rtype) -> String {
    format!("{}#{}", name, rtype.to_int())
}

//------------ Cache ---------------------------------------------------------

/// An asynchronous key/value store for answer sequences.
pub trait Cache: Send + Sync {
    /// Returns the stored answers for `key`, if any are still valid.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Option<Vec<Answer>>> + Send + '_>>;

    /// Stores `answers` under `key` for `ttl` seconds.
    fn set(
        &self,
        key: &str,
        answers: Vec<Answer>,
        ttl: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

//------------ MemoryCache ---------------------------------------------------

/// An in-memory cache backend.
///
/// Entries carry their own validity deadline; the underlying store merely
/// bounds the number of entries.
#[derive(Clone)]
pub struct MemoryCache {
    cache: moka::future::Cache<String, CacheEntry>,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    answers: Vec<Answer>,
    valid_until: Instant,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        MemoryCache {
            cache: moka::future::Cache::builder()
                .max_capacity(MAX_CACHE_ENTRIES)
                .build(),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Option<Vec<Answer>>> + Send + '_>>
    {
        let key = key.to_owned();
        Box::pin(async move {
            let entry = self.cache.get(&key).await?;
            if entry.valid_until <= Instant::now() {
                self.cache.invalidate(&key).await;
                return None;
            }
            Some(entry.answers)
        })
    }

    fn set(
        &self,
        key: &str,
        answers: Vec<Answer>,
        ttl: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let key = key.to_owned();
        Box::pin(async move {
            let entry = CacheEntry {
                answers,
                valid_until: Instant::now()
                    + Duration::from_secs(ttl.into()),
            };
            self.cache.insert(key, entry).await;
        })
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryCache::new();
        let answers =
            vec![Answer::new("192.0.2.1", Rtype::A, Some(300))];
        cache
            .set(&cache_key("host.example", Rtype::A), answers.clone(), 300)
            .await;
        assert_eq!(
            cache.get(&cache_key("host.example", Rtype::A)).await,
            Some(answers)
        );
        assert_eq!(
            cache.get(&cache_key("other.example", Rtype::A)).await,
            None
        );
    }

    #[tokio::test]
    async fn negative_entries_are_empty_sequences() {
        let cache = MemoryCache::new();
        let key = cache_key("nope.example", Rtype::AAAA);
        cache.set(&key, Vec::new(), NEGATIVE_TTL).await;
        assert_eq!(cache.get(&key).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache = MemoryCache::new();
        let key = cache_key("gone.example", Rtype::A);
        cache
            .set(&key, vec![Answer::new("192.0.2.9", Rtype::A, Some(0))], 0)
            .await;
        assert_eq!(cache.get(&key).await, None);
    }
}
