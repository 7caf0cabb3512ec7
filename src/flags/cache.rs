//! Short-TTL, size-bounded cache over remote flag evaluation results (C7).
//!
//! Modeled on the bounded LRU cache pattern from the `flagd` evaluation
//! engine in the broader example pack: a plain `lru::LruCache` guarded by a
//! mutex, plus a per-key in-flight lock so concurrent lookups for the same
//! identity collapse into a single upstream request.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

use crate::error::Error;
use crate::event::Groups;

use super::remote::RemoteFlagsResult;

struct Entry {
    value: RemoteFlagsResult,
    inserted_at: Instant,
}

pub struct FlagCache {
    ttl: Duration,
    cache: Mutex<LruCache<String, Entry>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlagCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            ttl,
            cache: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Stable cache key: distinct id plus sorted person/group properties, so
    /// semantically identical calls hit the same entry regardless of
    /// caller-side map ordering.
    pub fn key(distinct_id: &str, person_properties: Option<&Value>, groups: Option<&Groups>) -> String {
        let mut parts = vec![distinct_id.to_string()];

        if let Some(props) = person_properties {
            if let Value::Object(map) = props {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| k.clone());
                for (k, v) in entries {
                    parts.push(format!("p:{k}={v}"));
                }
            }
        }

        if let Some(groups) = groups {
            let mut entries: Vec<_> = groups.iter().collect();
            entries.sort_by(|a, b| (&a.group_type, &a.group_key).cmp(&(&b.group_type, &b.group_key)));
            for group in entries {
                parts.push(format!("g:{}={}", group.group_type, group.group_key));
            }
        }

        parts.join("|")
    }

    fn get_fresh(&self, key: &str) -> Option<RemoteFlagsResult> {
        let mut cache = self.cache.lock().expect("flag cache poisoned");
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: String, value: RemoteFlagsResult) {
        let mut cache = self.cache.lock().expect("flag cache poisoned");
        cache.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Returns the cached value for `key`, or runs `fetch` exactly once for
    /// all callers racing on the same key.
    pub async fn get_or_fetch<F, Fut>(&self, key: String, fetch: F) -> Result<RemoteFlagsResult, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RemoteFlagsResult, Error>>,
    {
        if let Some(hit) = self.get_fresh(&key) {
            return Ok(hit);
        }

        let lock = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let _guard = lock.lock().await;
        if let Some(hit) = self.get_fresh(&key) {
            self.in_flight.lock().expect("in-flight map poisoned").remove(&key);
            return Ok(hit);
        }

        let result = fetch().await;
        self.in_flight.lock().expect("in-flight map poisoned").remove(&key);

        let result = result?;
        self.insert(key.clone(), result.clone());
        Ok(result)
    }

    pub fn clear(&self) {
        self.cache.lock().expect("flag cache poisoned").clear();
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("in-flight map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_fetches_for_the_same_key_collapse() {
        let cache = Arc::new(FlagCache::new(100, Duration::from_secs(10)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("user-1".to_string(), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(RemoteFlagsResult::default())
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let cache = FlagCache::new(10, Duration::from_millis(10));
        let calls = AtomicUsize::new(0);

        cache
            .get_or_fetch("k".to_string(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(RemoteFlagsResult::default())
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        cache
            .get_or_fetch("k".to_string(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(RemoteFlagsResult::default())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_leak_an_in_flight_entry() {
        let cache = FlagCache::new(10, Duration::from_secs(10));

        let err = cache
            .get_or_fetch("k".to_string(), || async {
                Err(Error::Config("upstream down".into()))
            })
            .await;

        assert!(err.is_err());
        assert_eq!(cache.in_flight_len(), 0);
    }
}
