//! Wire/ruleset data model shared by the loader and the local evaluator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outcome of evaluating a single flag, cohort filter or dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
}

impl Default for FlagValue {
    fn default() -> Self {
        FlagValue::Boolean(false)
    }
}

impl FlagValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            FlagValue::Boolean(b) => *b,
            FlagValue::String(_) => true,
        }
    }

    pub fn as_json(&self) -> Value {
        match self {
            FlagValue::Boolean(b) => Value::Bool(*b),
            FlagValue::String(s) => Value::String(s.clone()),
        }
    }
}

/// A single property predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(rename = "type", default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub negation: bool,
    #[serde(default)]
    pub dependency_chain: Vec<String>,
}

fn default_operator() -> String {
    "exact".to_string()
}

impl PropertyFilter {
    pub fn property_type(&self) -> &str {
        self.property_type.as_deref().unwrap_or("person")
    }
}

/// `{"type": "AND"/"OR", "values": [...]}` — used for cohort definitions and
/// nested filter groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(rename = "type", default = "default_group_kind")]
    pub kind: String,
    #[serde(default)]
    pub values: Vec<FilterNode>,
}

fn default_group_kind() -> String {
    "AND".to_string()
}

impl FilterGroup {
    pub fn is_or(&self) -> bool {
        self.kind.eq_ignore_ascii_case("OR")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group(FilterGroup),
    Property(PropertyFilter),
}

/// A single rollout/targeting condition within a flag's `filters.groups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub properties: Vec<PropertyFilter>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultivariateVariant {
    pub key: String,
    pub rollout_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Multivariate {
    #[serde(default)]
    pub variants: Vec<MultivariateVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlagFilters {
    #[serde(default)]
    pub groups: Vec<Condition>,
    #[serde(default)]
    pub multivariate: Option<Multivariate>,
    #[serde(default)]
    pub payloads: HashMap<String, Value>,
    #[serde(default)]
    pub aggregation_group_type_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub key: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub filters: FlagFilters,
    #[serde(default)]
    pub ensure_experience_continuity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cohort {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub filters: FilterGroup,
}

/// An immutable, atomically-swappable snapshot of a project's flag rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub flags: Vec<FlagDefinition>,
    #[serde(default)]
    pub cohorts: HashMap<String, FilterGroup>,
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
}

impl Ruleset {
    pub fn flag(&self, key: &str) -> Option<&FlagDefinition> {
        self.flags.iter().find(|f| f.key == key)
    }
}

/// Raw body of the local-evaluation endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalEvaluationResponse {
    #[serde(default)]
    pub flags: Vec<FlagDefinition>,
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
    #[serde(default)]
    pub cohorts: HashMap<String, Value>,
}

impl From<LocalEvaluationResponse> for Ruleset {
    fn from(resp: LocalEvaluationResponse) -> Self {
        let cohorts = resp
            .cohorts
            .into_iter()
            .filter_map(|(id, raw)| {
                serde_json::from_value::<FilterGroup>(raw)
                    .ok()
                    .map(|group| (id, group))
            })
            .collect();
        Ruleset {
            flags: resp.flags,
            cohorts,
            group_type_mapping: resp.group_type_mapping,
        }
    }
}
