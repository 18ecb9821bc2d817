//! Change detection between two entity snapshots.
//!
//! Produces the ordered list of changes the notifier reports: the group
//! change first (if any), then grade changes sorted by subject and module.
//! Transitions into a sentinel value and unchanged values are never reported.

use crate::models::{AttributeMap, ChangeEvent, EntitySnapshot, is_sentinel, split_attribute_key};

/// Calculate the changes from `old` to `new`.
///
/// A missing `old` snapshot (first sync) diffs against an empty one.
pub fn diff(old: Option<&EntitySnapshot>, new: &EntitySnapshot) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();

    if let Some(group) = group_change(old.and_then(|o| o.group.as_deref()), new.group.as_deref()) {
        changes.push(group);
    }

    let empty = AttributeMap::new();
    let old_attributes = old.map(|o| &o.attributes).unwrap_or(&empty);
    changes.extend(grade_changes(old_attributes, &new.attributes));

    changes
}

fn group_change(old: Option<&str>, new: Option<&str>) -> Option<ChangeEvent> {
    let new = new.map(str::trim).filter(|g| !g.is_empty())?;
    let old = old.map(str::trim).filter(|g| !g.is_empty());
    if old == Some(new) {
        return None;
    }
    Some(ChangeEvent::Group {
        old: old.map(str::to_string),
        new: new.to_string(),
    })
}

fn grade_changes(old: &AttributeMap, new: &AttributeMap) -> Vec<ChangeEvent> {
    let mut changes: Vec<ChangeEvent> = new
        .iter()
        .filter_map(|(key, value)| {
            let value = value.as_deref();
            if is_sentinel(value) {
                return None;
            }
            let new_value = value?.trim();
            let old_value = old.get(key).and_then(|v| v.as_deref()).map(str::trim);
            if old_value == Some(new_value) {
                return None;
            }

            let (subject, module) = split_attribute_key(key);
            Some(ChangeEvent::Grade {
                subject: subject.to_string(),
                module: module.map(str::to_string),
                old: old_value.map(str::to_string),
                new: new_value.to_string(),
            })
        })
        .collect();

    changes.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    changes
}

fn sort_key(change: &ChangeEvent) -> (&str, Option<&str>) {
    match change {
        ChangeEvent::Grade {
            subject, module, ..
        } => (subject.as_str(), module.as_deref()),
        ChangeEvent::Group { .. } => ("", None),
    }
}
