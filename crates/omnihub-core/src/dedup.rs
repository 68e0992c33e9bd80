//! Inbound dedup: channel gateways redeliver webhooks, and a redelivered
//! `channel_message_id` must not trigger a second agent call. Keys are
//! scoped per instance and expire after a short TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

pub struct DedupCache {
    ttl: Duration,
    inner: Mutex<HashMap<(String, String), (Uuid, Instant)>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Trace id previously registered for this message, if still within
    /// the TTL. Expired entries are pruned on the way.
    pub fn check(&self, instance: &str, message_id: &str) -> Option<Uuid> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        map.retain(|_, (_, at)| now.duration_since(*at) < self.ttl);
        map.get(&(instance.to_string(), message_id.to_string()))
            .map(|(trace_id, _)| *trace_id)
    }

    pub fn register(&self, instance: &str, message_id: &str, trace_id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(
            (instance.to_string(), message_id.to_string()),
            (trace_id, Instant::now()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_message_returns_original_trace() {
        let cache = DedupCache::new(Duration::from_secs(10));
        let trace_id = Uuid::new_v4();
        assert!(cache.check("prod-wa", "3EB01").is_none());
        cache.register("prod-wa", "3EB01", trace_id);
        assert_eq!(cache.check("prod-wa", "3EB01"), Some(trace_id));
    }

    #[test]
    fn dedup_is_scoped_per_instance() {
        let cache = DedupCache::new(Duration::from_secs(10));
        cache.register("prod-wa", "3EB01", Uuid::new_v4());
        assert!(cache.check("other-wa", "3EB01").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = DedupCache::new(Duration::from_millis(10));
        cache.register("prod-wa", "3EB01", Uuid::new_v4());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.check("prod-wa", "3EB01").is_none());
    }
}
