//! Event enrichment and `$feature_flag_called` dedup (spec component C9,
//! §4.5). Injects flag/group/super-properties the way the ingestion API
//! expects them, and guards against re-emitting the same flag-call event
//! within a sliding TTL.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use semver::Version;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::ClientOptions;
use crate::event::Groups;
use crate::flags::model::FlagValue;
use crate::flags::FlagsEngine;

pub struct Enricher {
    options: Arc<ClientOptions>,
    flags: Arc<FlagsEngine>,
    dedup: Mutex<LruCache<(String, String, String), Instant>>,
    dedup_ttl: Duration,
}

impl Enricher {
    pub fn new(options: Arc<ClientOptions>, flags: Arc<FlagsEngine>) -> Self {
        let capacity = NonZeroUsize::new(options.feature_flag_sent_cache_size_limit.max(1))
            .expect("capacity is non-zero");
        let dedup_ttl = Duration::from_secs(options.feature_flag_sent_cache_sliding_expiration_seconds);
        Self {
            options,
            flags,
            dedup: Mutex::new(LruCache::new(capacity)),
            dedup_ttl,
        }
    }

    /// Library-reserved properties every event carries: distinct id already
    /// lives on `Properties`, this adds `$lib`/`$lib_version`(+semver parts),
    /// `$geoip_disable`, and configured super-properties.
    pub fn base_properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        let version_str = env!("CARGO_PKG_VERSION");
        props.insert("$lib".into(), Value::String("flagcore".into()));
        props.insert("$lib_version".into(), Value::String(version_str.into()));
        if let Ok(version) = version_str.parse::<Version>() {
            props.insert("$lib_version__major".into(), version.major.into());
            props.insert("$lib_version__minor".into(), version.minor.into());
            props.insert("$lib_version__patch".into(), version.patch.into());
        }
        if self.options.geoip_disable {
            props.insert("$geoip_disable".into(), Value::Bool(true));
        }
        for (key, value) in &self.options.super_properties {
            props.insert(key.clone(), value.clone());
        }
        props
    }

    pub fn merge_groups(&self, props: &mut Map<String, Value>, groups: Option<&Groups>) {
        if let Some(groups) = groups {
            if !groups.is_empty() {
                props.insert("$groups".into(), serde_json::to_value(groups).expect("groups serialize"));
            }
        }
    }

    /// Adds `$feature/<key>` for every evaluable flag and `$active_feature_flags`
    /// for the truthy subset. Errors are logged and swallowed: a failed
    /// enrichment must never block the event itself from being captured.
    ///
    /// `only_evaluate_locally` is the per-event `send_feature_flags` toggle
    /// from §4.5 inverted: `false` (the default) lets this fall back to
    /// cached/remote evaluation when the local evaluator is inconclusive;
    /// `true` keeps enrichment local-only even if that means some flags are
    /// simply absent from the result.
    pub async fn enrich_with_flags(
        &self,
        distinct_id: &str,
        properties: &mut Map<String, Value>,
        person_properties: Option<&Value>,
        groups: Option<&Groups>,
        only_evaluate_locally: bool,
    ) {
        let owned_props;
        let person_properties = match person_properties {
            Some(v) => v,
            None => {
                owned_props = Value::Object(properties.clone());
                &owned_props
            }
        };

        match self
            .flags
            .get_all_flags(distinct_id, Some(person_properties), groups, None, only_evaluate_locally)
            .await
        {
            Ok(flags) => {
                let mut active = Vec::new();
                for (key, value) in &flags {
                    properties.insert(format!("$feature/{key}"), value.as_json());
                    if value.is_truthy() {
                        active.push(key.clone());
                    }
                }
                properties.insert("$active_feature_flags".into(), Value::Array(active.into_iter().map(Value::String).collect()));
            }
            Err(e) => {
                warn!(error = %e, distinct_id, "feature flag enrichment failed, capturing without flag data");
            }
        }
    }

    /// Returns `true` the first time this `(distinct_id, flag_key, value)`
    /// tuple is seen within the sliding TTL; `false` on every repeat until
    /// the entry expires and is evicted.
    pub fn should_emit_feature_flag_called(&self, distinct_id: &str, flag_key: &str, value: &FlagValue) -> bool {
        let key = (distinct_id.to_string(), flag_key.to_string(), value_key(value));
        let mut cache = self.dedup.lock().expect("dedup cache poisoned");
        if let Some(seen_at) = cache.get(&key) {
            if seen_at.elapsed() < self.dedup_ttl {
                return false;
            }
        }
        cache.put(key, Instant::now());
        true
    }
}

fn value_key(value: &FlagValue) -> String {
    match value {
        FlagValue::Boolean(b) => b.to_string(),
        FlagValue::String(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptionsBuilder;

    fn enricher() -> Enricher {
        let options = Arc::new(
            ClientOptionsBuilder::default()
                .api_key("test-key")
                .feature_flag_sent_cache_size_limit(10usize)
                .feature_flag_sent_cache_sliding_expiration_seconds(60u64)
                .build()
                .unwrap(),
        );
        let transport: Arc<dyn crate::transport::Transport> =
            Arc::new(crate::transport::ReqwestTransport::new(&options));
        let flags = Arc::new(FlagsEngine::new(options.clone(), transport));
        Enricher::new(options, flags)
    }

    #[test]
    fn dedup_allows_first_call_and_blocks_repeat() {
        let enricher = enricher();
        assert!(enricher.should_emit_feature_flag_called("user-1", "flag-a", &FlagValue::Boolean(true)));
        assert!(!enricher.should_emit_feature_flag_called("user-1", "flag-a", &FlagValue::Boolean(true)));
    }

    #[test]
    fn dedup_distinguishes_by_value() {
        let enricher = enricher();
        assert!(enricher.should_emit_feature_flag_called("user-1", "flag-a", &FlagValue::String("control".into())));
        assert!(enricher.should_emit_feature_flag_called("user-1", "flag-a", &FlagValue::String("test".into())));
    }
}
