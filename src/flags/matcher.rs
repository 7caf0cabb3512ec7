//! Property predicate evaluation (spec component C2 / §4.1.1).

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::Value;

/// Outcome of evaluating one property filter.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Match(bool),
    Inconclusive(&'static str),
}

static REGEX_CACHE: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();

fn get_cached_regex(pattern: &str) -> Option<Regex> {
    let cache = REGEX_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().expect("regex cache poisoned");
    if let Some(existing) = guard.get(pattern) {
        return existing.clone();
    }
    let compiled = Regex::new(pattern).ok();
    guard.insert(pattern.to_string(), compiled.clone());
    compiled
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare_values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => a == b,
    }
}

fn compare_numeric(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let as_f64 = |v: &Value| -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    };
    as_f64(a)?.partial_cmp(&as_f64(b)?)
}

/// Parses `-<n>(h|d|w|m|y)` relative to `now`.
fn parse_relative_date(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let expr = expr.trim();
    let rest = expr.strip_prefix('-')?;
    let unit = rest.chars().last()?;
    let amount: i64 = rest[..rest.len() - 1].parse().ok()?;
    let duration = match unit {
        'h' => chrono::Duration::hours(amount),
        'd' => chrono::Duration::days(amount),
        'w' => chrono::Duration::weeks(amount),
        'm' => chrono::Duration::days(amount * 30),
        'y' => chrono::Duration::days(amount * 365),
        _ => return None,
    };
    Some(now - duration)
}

fn parse_date_value(value: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = value_to_string(value);
    if let Some(dt) = parse_relative_date(&s, now) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Some(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0)?,
            Utc,
        ));
    }
    None
}

/// Evaluates a single operator given the filter's expected `value` and the
/// resolved `comparand` pulled from the property bag (or `distinct_id`).
///
/// `comparand = None` means the property key is absent from the bag;
/// presence-only operators (`is_set`) are decidable from that alone, every
/// other operator becomes `Inconclusive("missing_property")` — including
/// `is_not`, since "we don't know" is not the same as "it's not that value".
/// A present-but-JSON-`null` comparand is a known value: it matches `false`
/// for every operator except `is_not`, which matches `true`. `is_not_set` is
/// never emulated locally (see spec §4.1.1) and always returns `Inconclusive`.
pub fn match_operator(
    operator: &str,
    expected: &Value,
    comparand: Option<&Value>,
    now: DateTime<Utc>,
) -> MatchOutcome {
    if operator == "is_not_set" {
        return MatchOutcome::Inconclusive("is_not_set_unsupported");
    }
    if operator == "is_set" {
        return MatchOutcome::Match(comparand.is_some());
    }

    let comparand = match comparand {
        Some(Value::Null) => return MatchOutcome::Match(operator == "is_not"),
        Some(v) => v,
        None => return MatchOutcome::Inconclusive("missing_property"),
    };

    match operator {
        "exact" => MatchOutcome::Match(values_in(comparand, expected)),
        "is_not" => MatchOutcome::Match(!values_in(comparand, expected)),
        "icontains" => MatchOutcome::Match(
            value_to_string(comparand)
                .to_lowercase()
                .contains(&value_to_string(expected).to_lowercase()),
        ),
        "not_icontains" => MatchOutcome::Match(
            !value_to_string(comparand)
                .to_lowercase()
                .contains(&value_to_string(expected).to_lowercase()),
        ),
        "regex" | "not_regex" => {
            let pattern = value_to_string(expected);
            match get_cached_regex(&pattern) {
                Some(re) => {
                    let is_match = re.is_match(&value_to_string(comparand));
                    MatchOutcome::Match(if operator == "regex" {
                        is_match
                    } else {
                        !is_match
                    })
                }
                None => MatchOutcome::Inconclusive("invalid_regex"),
            }
        }
        "gt" | "gte" | "lt" | "lte" => match compare_numeric(comparand, expected) {
            Some(ordering) => {
                use std::cmp::Ordering::*;
                let result = match (operator, ordering) {
                    ("gt", Greater) => true,
                    ("gte", Greater) | ("gte", Equal) => true,
                    ("lt", Less) => true,
                    ("lte", Less) | ("lte", Equal) => true,
                    _ => false,
                };
                MatchOutcome::Match(result)
            }
            None => MatchOutcome::Inconclusive("non_numeric_comparison"),
        },
        "is_date_before" | "is_date_after" => {
            match (parse_date_value(comparand, now), parse_date_value(expected, now)) {
                (Some(lhs), Some(rhs)) => MatchOutcome::Match(if operator == "is_date_before" {
                    lhs < rhs
                } else {
                    lhs > rhs
                }),
                _ => MatchOutcome::Inconclusive("invalid_date"),
            }
        }
        _ => MatchOutcome::Inconclusive("unsupported_operator"),
    }
}

fn values_in(comparand: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(candidates) => candidates.iter().any(|c| compare_values_eq(comparand, c)),
        other => compare_values_eq(comparand, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn exact_match_is_case_insensitive_for_strings() {
        let outcome = match_operator("exact", &json!("Foo"), Some(&json!("foo")), now());
        assert_eq!(outcome, MatchOutcome::Match(true));
    }

    #[test]
    fn is_not_set_is_always_inconclusive() {
        let outcome = match_operator("is_not_set", &json!(null), Some(&json!("x")), now());
        assert_eq!(outcome, MatchOutcome::Inconclusive("is_not_set_unsupported"));
        let outcome = match_operator("is_not_set", &json!(null), None, now());
        assert_eq!(outcome, MatchOutcome::Inconclusive("is_not_set_unsupported"));
    }

    #[test]
    fn is_set_true_when_present_false_when_absent() {
        assert_eq!(
            match_operator("is_set", &json!(null), Some(&json!("x")), now()),
            MatchOutcome::Match(true)
        );
        assert_eq!(
            match_operator("is_set", &json!(null), None, now()),
            MatchOutcome::Match(false)
        );
    }

    #[test]
    fn missing_property_is_inconclusive_for_every_operator_including_is_not() {
        assert_eq!(
            match_operator("exact", &json!("a"), None, now()),
            MatchOutcome::Inconclusive("missing_property")
        );
        assert_eq!(
            match_operator("is_not", &json!("a"), None, now()),
            MatchOutcome::Inconclusive("missing_property")
        );
    }

    #[test]
    fn present_null_is_a_known_value_not_a_missing_property() {
        assert_eq!(
            match_operator("exact", &json!("a"), Some(&json!(null)), now()),
            MatchOutcome::Match(false)
        );
        assert_eq!(
            match_operator("is_not", &json!("a"), Some(&json!(null)), now()),
            MatchOutcome::Match(true)
        );
    }

    #[test]
    fn icontains_is_case_insensitive_substring() {
        assert_eq!(
            match_operator("icontains", &json!("@company.com"), Some(&json!("a@COMPANY.com")), now()),
            MatchOutcome::Match(true)
        );
    }

    #[test]
    fn numeric_gt() {
        assert_eq!(
            match_operator("gt", &json!(10), Some(&json!(20)), now()),
            MatchOutcome::Match(true)
        );
        assert_eq!(
            match_operator("gt", &json!("not-a-number"), Some(&json!("also-not")), now()),
            MatchOutcome::Inconclusive("non_numeric_comparison")
        );
    }

    #[test]
    fn invalid_regex_is_inconclusive() {
        assert_eq!(
            match_operator("regex", &json!("("), Some(&json!("abc")), now()),
            MatchOutcome::Inconclusive("invalid_regex")
        );
    }

    #[test]
    fn relative_date_before() {
        let now = now();
        let five_days_ago = now - chrono::Duration::days(5);
        let comparand = json!(five_days_ago.to_rfc3339());
        let outcome = match_operator("is_date_before", &json!("-1d"), Some(&comparand), now);
        assert_eq!(outcome, MatchOutcome::Match(true));
    }
}
