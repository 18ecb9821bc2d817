//! Entity snapshot data structures.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Stored value for a subject the entity does not take.
pub const NOT_ENROLLED: &str = "not-enrolled";

/// Routing targets written when an administrator added the entity by hand.
pub const PLACEHOLDER_TARGETS: [&str; 2] = ["added by admin", "added_by_superadmin"];

/// Grade key (`"<subject> (module <n>)"`) to optional grade value.
pub type AttributeMap = BTreeMap<String, Option<String>>;

/// Build an attribute key for a subject and module.
pub fn attribute_key(subject: &str, module: &str) -> String {
    format!("{subject} (module {module})")
}

/// Split an attribute key into subject and module.
///
/// Keys without a module suffix come back whole with `None`.
pub fn split_attribute_key(key: &str) -> (&str, Option<&str>) {
    key.rsplit_once(" (module ")
        .and_then(|(subject, rest)| rest.strip_suffix(')').map(|module| (subject, Some(module))))
        .unwrap_or((key, None))
}

/// Whether a value means "no real grade".
pub fn is_sentinel(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => {
            let v = v.trim();
            v.is_empty() || v == NOT_ENROLLED
        }
    }
}

/// Messaging address of an entity's owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RoutingTarget(String);

impl RoutingTarget {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Target used for entities added by an administrator.
    pub fn placeholder() -> Self {
        Self(PLACEHOLDER_TARGETS[0].to_string())
    }

    pub fn is_placeholder(&self) -> bool {
        let raw = self.0.trim();
        raw.is_empty() || PLACEHOLDER_TARGETS.contains(&raw)
    }

    /// The deliverable address, or `None` for placeholders.
    pub fn address(&self) -> Option<&str> {
        if self.is_placeholder() {
            None
        } else {
            Some(self.0.trim())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted state of one tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,

    pub display_name: String,

    #[serde(default)]
    pub attributes: AttributeMap,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub target: RoutingTarget,

    /// `None` until the first successful sync
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
}

impl EntitySnapshot {
    /// A registered entity that has never been synced.
    pub fn registered(
        entity_id: impl Into<String>,
        target: RoutingTarget,
        group: Option<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            display_name: String::new(),
            attributes: AttributeMap::new(),
            group,
            target,
            last_synced: None,
        }
    }

    /// Build the snapshot that replaces `previous` after a successful fetch.
    ///
    /// Previously stored subjects missing from `known_subjects` are marked
    /// [`NOT_ENROLLED`]; keys of known subjects the provider stopped reporting
    /// are cleared. The sync timestamp never moves backwards.
    pub fn refreshed(
        previous: Option<&EntitySnapshot>,
        queued: &StaleEntity,
        fetched: &FetchedSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        let known: BTreeSet<&str> = fetched.known_subjects.iter().map(String::as_str).collect();

        let mut attributes = AttributeMap::new();
        if let Some(prev) = previous {
            for key in prev.attributes.keys() {
                let (subject, _) = split_attribute_key(key);
                let value = if known.contains(subject) {
                    None
                } else {
                    Some(NOT_ENROLLED.to_string())
                };
                attributes.insert(key.clone(), value);
            }
        }
        for (key, value) in &fetched.attributes {
            attributes.insert(key.clone(), value.clone());
        }

        let group = fetched
            .group
            .clone()
            .or_else(|| queued.group.clone())
            .or_else(|| previous.and_then(|p| p.group.clone()));

        let last_synced = match previous.and_then(|p| p.last_synced) {
            Some(prev) if prev > now => prev,
            _ => now,
        };

        Self {
            entity_id: queued.entity_id.clone(),
            display_name: fetched.display_name.clone(),
            attributes,
            group,
            target: queued.target.clone(),
            last_synced: Some(last_synced),
        }
    }
}

/// Queue item: one entity due for a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleEntity {
    pub entity_id: String,
    pub target: RoutingTarget,
    pub group: Option<String>,
}

impl From<&EntitySnapshot> for StaleEntity {
    fn from(snapshot: &EntitySnapshot) -> Self {
        Self {
            entity_id: snapshot.entity_id.clone(),
            target: snapshot.target.clone(),
            group: snapshot.group.clone(),
        }
    }
}

/// Fresh data returned by the external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FetchedSnapshot {
    pub display_name: String,

    #[serde(default, deserialize_with = "stringified_values")]
    pub attributes: AttributeMap,

    /// Subjects the entity currently takes
    #[serde(default)]
    pub known_subjects: Vec<String>,

    #[serde(default)]
    pub group: Option<String>,

    /// Course-work files contributed by the entity
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A course-work file reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Archive category (discipline)
    pub category: String,

    #[serde(default)]
    pub semester: Option<String>,

    /// Local path once downloaded
    #[serde(default)]
    pub path: Option<String>,

    /// Remote location, if not yet downloaded
    #[serde(default)]
    pub url: Option<String>,
}

/// Accept numbers, strings, booleans and nulls as grade values.
fn stringified_values<'de, D>(deserializer: D) -> Result<AttributeMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_json::Value> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s),
                other => Some(other.to_string()),
            };
            (key, value)
        })
        .collect())
}
