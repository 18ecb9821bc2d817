//! Change events produced by snapshot diffs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single detected change for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// The entity moved to another group
    Group { old: Option<String>, new: String },

    /// A grade changed for one subject module
    Grade {
        subject: String,
        module: Option<String>,
        old: Option<String>,
        new: String,
    },
}

impl ChangeEvent {
    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let old_or_dash = |old: &Option<String>| old.clone().unwrap_or_else(|| "-".to_string());
        match self {
            Self::Group { old, new } => write!(f, "Group: {} → {}", old_or_dash(old), new),
            Self::Grade {
                subject,
                module: Some(module),
                old,
                new,
            } => write!(
                f,
                "{subject} (module {module}): {} → {new}",
                old_or_dash(old)
            ),
            Self::Grade {
                subject,
                module: None,
                old,
                new,
            } => write!(f, "{subject}: {} → {new}", old_or_dash(old)),
        }
    }
}
