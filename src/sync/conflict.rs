//! Field-level conflict detection for queued updates.

use serde_json::Value;

use crate::models::{Patch, Record};

/// Compare what the user saw (`snapshot`) against what the server has now.
///
/// Only fields the update touches are checked: a field counts as conflicting
/// when the server's value moved away from the snapshot's. Returns one
/// message covering every conflicting field, in declaration order, or `None`
/// when the update can be sent as-is.
pub fn detect(snapshot: &Record, server: &Record, change: &Patch) -> Option<String> {
    let before = snapshot.fields();
    let now = server.fields();

    let conflicts: Vec<String> = change
        .requested_fields()
        .into_iter()
        .filter_map(|(field, requested)| {
            let old = before.get(field).unwrap_or(&Value::Null);
            let theirs = now.get(field).unwrap_or(&Value::Null);
            (old != theirs).then(|| {
                format!(
                    "{}: you changed {}→{}, server has {}",
                    field,
                    display(old),
                    display(&requested),
                    display(theirs)
                )
            })
        })
        .collect();

    if conflicts.is_empty() {
        None
    } else {
        Some(conflicts.join("; "))
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "none".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
