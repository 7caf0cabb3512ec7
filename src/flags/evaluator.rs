//! Local flag evaluator (spec component C4, §4.1).

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::hash::{bucket, ROLLOUT_SALT, VARIANT_SALT};

use super::matcher::{match_operator, MatchOutcome};
use super::model::{Condition, FilterGroup, FilterNode, FlagDefinition, FlagValue, PropertyFilter, Ruleset};

/// Result of evaluating a single flag (or a property-level sub-evaluation).
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Match(FlagValue),
    Inconclusive(String),
    NotFound,
}

/// One aggregation group's identity for group-scoped flags.
#[derive(Debug, Clone)]
pub struct GroupContext {
    pub key: String,
    pub properties: Value,
}

/// Everything the evaluator needs to resolve a flag: the ruleset plus the
/// caller-provided identity.
pub struct EvalContext<'a> {
    pub ruleset: &'a Ruleset,
    pub distinct_id: &'a str,
    pub person_properties: &'a Value,
    pub groups: &'a HashMap<String, GroupContext>,
}

/// Per-top-level-call cache so a flag referenced by multiple dependency
/// chains is computed at most once, and so cycles resolve to `Inconclusive`
/// instead of recursing forever.
pub type EvalCache = HashMap<String, EvalOutcome>;

enum ConditionOutcome {
    Matched,
    NotMatched,
    Inconclusive(String),
}

/// Evaluates a single flag by key, using (and populating) `cache` for any
/// flag-dependency lookups triggered along the way.
pub fn evaluate_flag(ctx: &EvalContext, key: &str, cache: &mut EvalCache) -> EvalOutcome {
    if let Some(existing) = cache.get(key) {
        return existing.clone();
    }
    // Guard against dependency cycles: anything that re-enters this key
    // before we've finished resolving it sees "inconclusive", not infinite
    // recursion.
    cache.insert(key.to_string(), EvalOutcome::Inconclusive("circular_dependency".into()));
    let result = evaluate_flag_inner(ctx, key, cache);
    cache.insert(key.to_string(), result.clone());
    result
}

fn evaluate_flag_inner(ctx: &EvalContext, key: &str, cache: &mut EvalCache) -> EvalOutcome {
    let flag = match ctx.ruleset.flag(key) {
        Some(f) => f,
        None => return EvalOutcome::NotFound,
    };

    if flag.ensure_experience_continuity {
        return EvalOutcome::Inconclusive("experience_continuity".into());
    }
    if !flag.active {
        return EvalOutcome::Match(FlagValue::Boolean(false));
    }

    let owned_props;
    let (eval_id, eval_props): (&str, &Value) =
        if let Some(group_type_index) = flag.filters.aggregation_group_type_index {
            let group_type = match ctx.ruleset.group_type_mapping.get(&group_type_index.to_string()) {
                Some(t) => t,
                None => return EvalOutcome::Inconclusive("unknown_group_type".into()),
            };
            match ctx.groups.get(group_type) {
                Some(group) => {
                    owned_props = group.properties.clone();
                    (group.key.as_str(), &owned_props)
                }
                None => {
                    debug!(flag = key, group_type = %group_type, "no group of this type provided");
                    return EvalOutcome::Match(FlagValue::Boolean(false));
                }
            }
        } else {
            (ctx.distinct_id, ctx.person_properties)
        };

    let mut any_inconclusive = false;
    for condition in &flag.filters.groups {
        match evaluate_condition(ctx, flag, condition, eval_id, eval_props, cache) {
            ConditionOutcome::Matched => {
                return EvalOutcome::Match(resolve_match_value(flag, condition, eval_id));
            }
            ConditionOutcome::Inconclusive(reason) => {
                trace!(flag = key, reason = %reason, "condition inconclusive");
                any_inconclusive = true;
            }
            ConditionOutcome::NotMatched => {}
        }
    }

    if any_inconclusive {
        EvalOutcome::Inconclusive("all_properties_unknown".into())
    } else {
        EvalOutcome::Match(FlagValue::Boolean(false))
    }
}

fn resolve_match_value(flag: &FlagDefinition, condition: &Condition, eval_id: &str) -> FlagValue {
    if let Some(variant) = &condition.variant {
        let is_known = flag
            .filters
            .multivariate
            .as_ref()
            .map(|m| m.variants.iter().any(|v| &v.key == variant))
            .unwrap_or(false);
        if is_known {
            return FlagValue::String(variant.clone());
        }
    }
    match &flag.filters.multivariate {
        Some(m) if !m.variants.is_empty() => select_variant(&flag.key, eval_id, &m.variants),
        _ => FlagValue::Boolean(true),
    }
}

fn select_variant(flag_key: &str, eval_id: &str, variants: &[super::model::MultivariateVariant]) -> FlagValue {
    let h = bucket(flag_key, eval_id, VARIANT_SALT);
    let mut cumulative = 0.0;
    for variant in variants {
        let upper = cumulative + variant.rollout_percentage / 100.0;
        if h >= cumulative && h < upper {
            return FlagValue::String(variant.key.clone());
        }
        cumulative = upper;
    }
    FlagValue::Boolean(false)
}

fn evaluate_condition(
    ctx: &EvalContext,
    flag: &FlagDefinition,
    condition: &Condition,
    eval_id: &str,
    eval_props: &Value,
    cache: &mut EvalCache,
) -> ConditionOutcome {
    for filter in &condition.properties {
        match evaluate_property_filter(ctx, filter, eval_id, eval_props, cache) {
            MatchOutcome::Inconclusive(reason) => return ConditionOutcome::Inconclusive(reason.to_string()),
            MatchOutcome::Match(matched) => {
                let matched = if filter.negation { !matched } else { matched };
                if !matched {
                    return ConditionOutcome::NotMatched;
                }
            }
        }
    }

    let rollout = condition.rollout_percentage.unwrap_or(100.0) / 100.0;
    let h = bucket(&flag.key, eval_id, ROLLOUT_SALT);
    if h <= rollout {
        ConditionOutcome::Matched
    } else {
        ConditionOutcome::NotMatched
    }
}

fn evaluate_property_filter(
    ctx: &EvalContext,
    filter: &PropertyFilter,
    eval_id: &str,
    eval_props: &Value,
    cache: &mut EvalCache,
) -> MatchOutcome {
    match filter.property_type() {
        "cohort" => evaluate_cohort(ctx, &filter.value, eval_id, eval_props, cache),
        "flag" => evaluate_flag_dependency(ctx, filter, cache),
        _ => {
            let comparand = resolve_comparand(filter, eval_id, eval_props);
            match_operator(&filter.operator, &filter.value, comparand.as_ref(), chrono::Utc::now())
        }
    }
}

fn resolve_comparand(filter: &PropertyFilter, distinct_id: &str, properties: &Value) -> Option<Value> {
    if filter.key == "distinct_id" {
        return Some(Value::String(distinct_id.to_string()));
    }
    properties.get(&filter.key).cloned()
}

fn evaluate_cohort(
    ctx: &EvalContext,
    cohort_id: &Value,
    eval_id: &str,
    eval_props: &Value,
    cache: &mut EvalCache,
) -> MatchOutcome {
    let id = match cohort_id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match ctx.ruleset.cohorts.get(&id) {
        None => MatchOutcome::Inconclusive("server_required"),
        Some(group) => evaluate_filter_group(ctx, group, eval_id, eval_props, cache),
    }
}

fn evaluate_filter_group(
    ctx: &EvalContext,
    group: &FilterGroup,
    eval_id: &str,
    eval_props: &Value,
    cache: &mut EvalCache,
) -> MatchOutcome {
    let mut any_inconclusive = false;
    for node in &group.values {
        let outcome = match node {
            FilterNode::Property(filter) => {
                let result = evaluate_property_filter(ctx, filter, eval_id, eval_props, cache);
                match result {
                    MatchOutcome::Match(m) if filter.negation => MatchOutcome::Match(!m),
                    other => other,
                }
            }
            FilterNode::Group(nested) => evaluate_filter_group(ctx, nested, eval_id, eval_props, cache),
        };

        match outcome {
            MatchOutcome::Inconclusive(_) => {
                any_inconclusive = true;
                if group.is_or() {
                    continue;
                }
            }
            MatchOutcome::Match(true) => {
                if group.is_or() {
                    return MatchOutcome::Match(true);
                }
            }
            MatchOutcome::Match(false) => {
                if !group.is_or() {
                    return MatchOutcome::Match(false);
                }
            }
        }
    }

    if any_inconclusive {
        MatchOutcome::Inconclusive("nested_filter_unknown")
    } else {
        MatchOutcome::Match(!group.is_or())
    }
}

fn evaluate_flag_dependency(ctx: &EvalContext, filter: &PropertyFilter, cache: &mut EvalCache) -> MatchOutcome {
    if filter.dependency_chain.is_empty() {
        return MatchOutcome::Inconclusive("circular_dependency");
    }
    if filter.dependency_chain.last() != Some(&filter.key) {
        return MatchOutcome::Inconclusive("bad_chain");
    }

    for dep_key in &filter.dependency_chain {
        if !cache.contains_key(dep_key) {
            let result = evaluate_flag(ctx, dep_key, cache);
            cache.insert(dep_key.clone(), result);
        }
    }

    match cache.get(&filter.key) {
        Some(EvalOutcome::Match(value)) => {
            let matches = match &filter.value {
                Value::Bool(expected) => value.is_truthy() == *expected,
                Value::String(expected) => matches!(value, FlagValue::String(v) if v == expected),
                _ => false,
            };
            let matches = if filter.operator == "is_not" { !matches } else { matches };
            MatchOutcome::Match(matches)
        }
        Some(EvalOutcome::Inconclusive(reason)) => {
            warn!(dependency = %filter.key, reason = %reason, "flag dependency inconclusive");
            MatchOutcome::Inconclusive("dependency_inconclusive")
        }
        Some(EvalOutcome::NotFound) | None => MatchOutcome::Inconclusive("missing_dependency"),
    }
}

/// Evaluates every flag in the ruleset, returning the matched values plus a
/// flag telling the caller whether any flag needs a remote fallback.
pub fn evaluate_all(ctx: &EvalContext) -> (HashMap<String, FlagValue>, bool) {
    let mut results = HashMap::new();
    let mut fallback_to_remote = false;
    let mut cache = EvalCache::new();

    for flag in &ctx.ruleset.flags {
        match evaluate_flag(ctx, &flag.key, &mut cache) {
            EvalOutcome::Match(value) => {
                results.insert(flag.key.clone(), value);
            }
            EvalOutcome::Inconclusive(reason) => {
                debug!(flag = %flag.key, reason = %reason, "flag needs remote evaluation");
                fallback_to_remote = true;
            }
            EvalOutcome::NotFound => {
                fallback_to_remote = true;
            }
        }
    }

    (results, fallback_to_remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::model::{FlagFilters, Multivariate, MultivariateVariant};
    use serde_json::json;

    fn ctx<'a>(ruleset: &'a Ruleset, props: &'a Value, groups: &'a HashMap<String, GroupContext>) -> EvalContext<'a> {
        EvalContext {
            ruleset,
            distinct_id: "user-1",
            person_properties: props,
            groups,
        }
    }

    fn simple_flag(key: &str, rollout: f64) -> FlagDefinition {
        FlagDefinition {
            key: key.to_string(),
            active: true,
            ensure_experience_continuity: false,
            filters: FlagFilters {
                groups: vec![Condition {
                    properties: vec![],
                    rollout_percentage: Some(rollout),
                    variant: None,
                }],
                multivariate: None,
                payloads: HashMap::new(),
                aggregation_group_type_index: None,
            },
        }
    }

    #[test]
    fn inactive_flag_is_false() {
        let mut flag = simple_flag("f", 100.0);
        flag.active = false;
        let ruleset = Ruleset {
            flags: vec![flag],
            ..Default::default()
        };
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "f", &mut cache);
        assert_eq!(outcome, EvalOutcome::Match(FlagValue::Boolean(false)));
    }

    #[test]
    fn full_rollout_matches_everyone() {
        let ruleset = Ruleset {
            flags: vec![simple_flag("f", 100.0)],
            ..Default::default()
        };
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "f", &mut cache);
        assert_eq!(outcome, EvalOutcome::Match(FlagValue::Boolean(true)));
    }

    #[test]
    fn missing_flag_is_not_found() {
        let ruleset = Ruleset::default();
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "nope", &mut cache);
        assert_eq!(outcome, EvalOutcome::NotFound);
    }

    #[test]
    fn multivariate_condition_selects_a_known_variant() {
        let mut flag = simple_flag("multi", 100.0);
        flag.filters.multivariate = Some(Multivariate {
            variants: vec![
                MultivariateVariant { key: "control".into(), rollout_percentage: 50.0 },
                MultivariateVariant { key: "test".into(), rollout_percentage: 50.0 },
            ],
        });
        let ruleset = Ruleset {
            flags: vec![flag],
            ..Default::default()
        };
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "multi", &mut cache);
        match outcome {
            EvalOutcome::Match(FlagValue::String(variant)) => {
                assert!(variant == "control" || variant == "test");
            }
            other => panic!("expected a variant match, got {other:?}"),
        }
    }

    #[test]
    fn property_predicate_gates_rollout() {
        let mut flag = simple_flag("gated", 100.0);
        flag.filters.groups[0].properties.push(PropertyFilter {
            key: "email".into(),
            value: json!("@company.com"),
            operator: "icontains".into(),
            property_type: None,
            negation: false,
            dependency_chain: vec![],
        });
        let ruleset = Ruleset {
            flags: vec![flag],
            ..Default::default()
        };
        let groups = HashMap::new();
        let mut cache = EvalCache::new();

        let matching_props = json!({"email": "a@company.com"});
        let outcome = evaluate_flag(&ctx(&ruleset, &matching_props, &groups), "gated", &mut cache);
        assert_eq!(outcome, EvalOutcome::Match(FlagValue::Boolean(true)));

        let mut cache = EvalCache::new();
        let other_props = json!({"email": "a@example.com"});
        let outcome = evaluate_flag(&ctx(&ruleset, &other_props, &groups), "gated", &mut cache);
        assert_eq!(outcome, EvalOutcome::Match(FlagValue::Boolean(false)));
    }

    #[test]
    fn empty_dependency_chain_is_inconclusive_not_a_hang() {
        let mut flag = simple_flag("dependent", 100.0);
        flag.filters.groups[0].properties.push(PropertyFilter {
            key: "upstream".into(),
            value: json!(true),
            operator: "exact".into(),
            property_type: Some("flag".into()),
            negation: false,
            dependency_chain: vec![],
        });
        let ruleset = Ruleset {
            flags: vec![flag],
            ..Default::default()
        };
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "dependent", &mut cache);
        assert_eq!(outcome, EvalOutcome::Inconclusive("all_properties_unknown".into()));
    }

    #[test]
    fn flag_dependency_resolves_through_chain() {
        let upstream = simple_flag("upstream", 100.0);
        let mut dependent = simple_flag("dependent", 100.0);
        dependent.filters.groups[0].properties.push(PropertyFilter {
            key: "upstream".into(),
            value: json!(true),
            operator: "exact".into(),
            property_type: Some("flag".into()),
            negation: false,
            dependency_chain: vec!["upstream".into()],
        });
        let ruleset = Ruleset {
            flags: vec![upstream, dependent],
            ..Default::default()
        };
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "dependent", &mut cache);
        assert_eq!(outcome, EvalOutcome::Match(FlagValue::Boolean(true)));
    }

    #[test]
    fn group_flag_without_matching_group_is_false_not_inconclusive() {
        let mut flag = simple_flag("company-flag", 100.0);
        flag.filters.aggregation_group_type_index = Some(0);
        let mut ruleset = Ruleset {
            flags: vec![flag],
            ..Default::default()
        };
        ruleset.group_type_mapping.insert("0".into(), "company".into());
        let props = json!({});
        let groups = HashMap::new();
        let mut cache = EvalCache::new();
        let outcome = evaluate_flag(&ctx(&ruleset, &props, &groups), "company-flag", &mut cache);
        assert_eq!(outcome, EvalOutcome::Match(FlagValue::Boolean(false)));
    }
}
