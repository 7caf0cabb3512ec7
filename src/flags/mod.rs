//! Flag evaluation: local evaluator, ruleset loader, remote fallback and the
//! short-TTL cache in front of it, wired together behind [`FlagsEngine`].

pub mod cache;
pub mod evaluator;
pub mod loader;
pub mod matcher;
pub mod model;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use crate::config::ClientOptions;
use crate::error::Error;
use crate::event::Groups;
use crate::transport::Transport;

use cache::FlagCache;
use evaluator::{evaluate_all, evaluate_flag, EvalCache, EvalContext, EvalOutcome, GroupContext};
use loader::RulesetLoader;
use model::FlagValue;
use remote::RemoteFlagFetcher;

const REMOTE_CACHE_CAPACITY: usize = 10_000;
const REMOTE_CACHE_TTL: Duration = Duration::from_secs(10);

fn group_contexts(
    groups: Option<&Groups>,
    group_properties: Option<&HashMap<String, Value>>,
) -> HashMap<String, GroupContext> {
    let mut out = HashMap::new();
    if let Some(groups) = groups {
        for group in groups.iter() {
            let properties = group_properties
                .and_then(|m| m.get(&group.group_type))
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            out.insert(
                group.group_type.clone(),
                GroupContext {
                    key: group.group_key.clone(),
                    properties,
                },
            );
        }
    }
    out
}

/// Ties the local evaluator, ruleset poller, and remote fallback cache
/// together behind the state machine described in §4.6: try local, fall
/// back to cached/remote evaluation only when local is unavailable or
/// inconclusive.
pub struct FlagsEngine {
    loader: Option<Arc<RulesetLoader>>,
    remote: RemoteFlagFetcher,
    cache: FlagCache,
}

impl FlagsEngine {
    pub fn new(options: Arc<ClientOptions>, transport: Arc<dyn Transport>) -> Self {
        let loader = if options.enable_local_evaluation {
            Some(RulesetLoader::new(options.clone(), transport.clone()))
        } else {
            None
        };
        let remote = RemoteFlagFetcher::new(transport, options);
        Self {
            loader,
            remote,
            cache: FlagCache::new(REMOTE_CACHE_CAPACITY, REMOTE_CACHE_TTL),
        }
    }

    pub async fn start(&self) {
        if let Some(loader) = &self.loader {
            loader.start().await;
        }
    }

    pub async fn reload(&self) -> Result<(), Error> {
        if let Some(loader) = &self.loader {
            loader.refresh().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, person_properties, groups, group_properties))]
    pub async fn get_feature_flag(
        &self,
        key: &str,
        distinct_id: &str,
        person_properties: Option<&Value>,
        groups: Option<&Groups>,
        group_properties: Option<&HashMap<String, Value>>,
        only_evaluate_locally: bool,
    ) -> Result<Option<FlagValue>, Error> {
        if let Some(local) = self.try_local_single(key, distinct_id, person_properties, groups, group_properties) {
            return Ok(local);
        }
        if only_evaluate_locally {
            return Ok(None);
        }

        let cache_key = FlagCache::key(distinct_id, person_properties, groups);
        let remote = &self.remote;
        let result = self
            .cache
            .get_or_fetch(cache_key, || remote.fetch(distinct_id, person_properties, groups, group_properties))
            .await?;
        Ok(result.feature_flags.get(key).cloned())
    }

    /// Returns `Some(value)` if the local evaluator produced a definitive
    /// answer, `None` if it was unavailable/inconclusive and remote
    /// evaluation needs to be tried (distinct from "flag evaluates false").
    fn try_local_single(
        &self,
        key: &str,
        distinct_id: &str,
        person_properties: Option<&Value>,
        groups: Option<&Groups>,
        group_properties: Option<&HashMap<String, Value>>,
    ) -> Option<Option<FlagValue>> {
        let loader = self.loader.as_ref()?;
        let ruleset = loader.current()?;
        let empty_props = Value::Object(Default::default());
        let props = person_properties.unwrap_or(&empty_props);
        let group_ctx = group_contexts(groups, group_properties);
        let ctx = EvalContext {
            ruleset: &ruleset,
            distinct_id,
            person_properties: props,
            groups: &group_ctx,
        };
        let mut cache = EvalCache::new();
        match evaluate_flag(&ctx, key, &mut cache) {
            EvalOutcome::Match(value) => Some(Some(value)),
            EvalOutcome::NotFound | EvalOutcome::Inconclusive(_) => None,
        }
    }

    #[instrument(skip(self, person_properties, groups, group_properties))]
    pub async fn get_all_flags(
        &self,
        distinct_id: &str,
        person_properties: Option<&Value>,
        groups: Option<&Groups>,
        group_properties: Option<&HashMap<String, Value>>,
        only_evaluate_locally: bool,
    ) -> Result<HashMap<String, FlagValue>, Error> {
        let mut combined = HashMap::new();
        let mut needs_remote = true;

        if let Some(loader) = &self.loader {
            if let Some(ruleset) = loader.current() {
                let empty_props = Value::Object(Default::default());
                let props = person_properties.unwrap_or(&empty_props);
                let group_ctx = group_contexts(groups, group_properties);
                let ctx = EvalContext {
                    ruleset: &ruleset,
                    distinct_id,
                    person_properties: props,
                    groups: &group_ctx,
                };
                let (local, fallback) = evaluate_all(&ctx);
                combined.extend(local);
                needs_remote = fallback;
            }
        }

        if !needs_remote || only_evaluate_locally {
            return Ok(combined);
        }

        let cache_key = FlagCache::key(distinct_id, person_properties, groups);
        let remote = &self.remote;
        let result = self
            .cache
            .get_or_fetch(cache_key, || remote.fetch(distinct_id, person_properties, groups, group_properties))
            .await?;
        for (key, value) in result.feature_flags {
            combined.entry(key).or_insert(value);
        }
        Ok(combined)
    }

    pub fn shutdown(&self) {
        if let Some(loader) = &self.loader {
            loader.shutdown();
        }
        self.cache.clear();
    }
}
