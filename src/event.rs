use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::Error;

/// A single named group the event (or flag evaluation) is attributed to,
/// e.g. `Group::new("company", "acme-inc")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub group_type: String,
    pub group_key: String,
}

impl Group {
    pub fn new<T: Into<String>, K: Into<String>>(group_type: T, group_key: K) -> Self {
        Self {
            group_type: group_type.into(),
            group_key: group_key.into(),
        }
    }
}

/// An ordered, type-unique set of [`Group`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Groups(Vec<Group>);

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: Group) {
        if let Some(existing) = self.0.iter_mut().find(|g| g.group_type == group.group_type) {
            *existing = group;
        } else {
            self.0.push(group);
        }
    }

    pub fn get(&self, group_type: &str) -> Option<&Group> {
        self.0.iter().find(|g| g.group_type == group_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{type: key}` shape expected on the wire.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .map(|g| (g.group_type.clone(), g.group_key.clone()))
            .collect()
    }
}

impl Serialize for Groups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

/// A bag of arbitrary event/person properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Properties {
    pub distinct_id: String,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Properties {
    pub fn new<S: Into<String>>(distinct_id: S) -> Self {
        Self {
            distinct_id: distinct_id.into(),
            props: Map::new(),
        }
    }

    pub fn insert<K: Into<String>, P: Serialize>(&mut self, key: K, prop: P) -> Result<(), Error> {
        let value = serde_json::to_value(prop)?;
        self.props.insert(key.into(), value);
        Ok(())
    }
}

/// An event pending capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event: String,
    pub properties: Properties,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Groups::is_empty")]
    pub groups: Groups,
    /// Local capture-time option, never sent over the wire: whether
    /// `Client::capture` may fall back to remote flag evaluation while
    /// enriching this event, or must stay local-only. Defaults to `true`.
    #[serde(skip)]
    pub send_feature_flags: bool,
}

impl Event {
    pub fn new<S: Into<String>>(event: S, distinct_id: S) -> Self {
        Self {
            event: event.into(),
            properties: Properties::new(distinct_id),
            timestamp: None,
            groups: Groups::new(),
            send_feature_flags: true,
        }
    }

    pub fn timestamp_now(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    pub fn insert_prop<K: Into<String>, P: Serialize>(
        &mut self,
        key: K,
        prop: P,
    ) -> Result<(), Error> {
        self.properties.insert(key, prop)
    }

    pub fn set_groups(&mut self, groups: Groups) {
        self.groups = groups;
    }

    /// Controls whether enrichment for this event may fall back to remote
    /// flag evaluation (`true`, the default) or must stay local-only
    /// (`false`).
    pub fn set_send_feature_flags(&mut self, send_feature_flags: bool) {
        self.send_feature_flags = send_feature_flags;
    }
}

/// Builds the `$feature_flag_called` event emitted after a flag lookup.
pub fn feature_flag_called_event(
    distinct_id: &str,
    flag_key: &str,
    response: &Value,
) -> Event {
    let mut event = Event::new("$feature_flag_called", distinct_id);
    let _ = event.insert_prop("$feature_flag", flag_key);
    let _ = event.insert_prop("$feature_flag_response", response.clone());
    event
}
