//! Partial-update descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A change rejected before it ever reaches the queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{0} cannot be cleared")]
    NotClearable(&'static str),

    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("Priority must be between 1 and 4, got {0}")]
    Priority(u8),

    #[error("Cannot apply a {patch} change to a {entity}")]
    KindMismatch {
        patch: &'static str,
        entity: &'static str,
    },

    #[error("Nothing to change")]
    NoChanges,
}

/// What a partial update does to one field.
///
/// Keeps "leave as is" and "explicitly remove" apart, which a plain
/// `Option` cannot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldUpdate<T> {
    Unchanged,
    Set(T),
    Clear,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Unchanged
    }
}

impl<T> FieldUpdate<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, FieldUpdate::Unchanged)
    }

    /// Builds an update from CLI-style flags: a new value wins over `clear`.
    pub fn from_flags(value: Option<T>, clear: bool) -> Self {
        match (value, clear) {
            (Some(v), _) => FieldUpdate::Set(v),
            (None, true) => FieldUpdate::Clear,
            (None, false) => FieldUpdate::Unchanged,
        }
    }
}

impl<T: Clone> FieldUpdate<T> {
    /// Applies to a nullable field.
    pub fn apply_optional(&self, target: &mut Option<T>) {
        match self {
            FieldUpdate::Unchanged => {}
            FieldUpdate::Set(v) => *target = Some(v.clone()),
            FieldUpdate::Clear => *target = None,
        }
    }

    /// Applies to a field that has no "absent" state.
    pub fn apply_required(&self, target: &mut T, field: &'static str) -> Result<(), ValidationError> {
        match self {
            FieldUpdate::Unchanged => Ok(()),
            FieldUpdate::Set(v) => {
                *target = v.clone();
                Ok(())
            }
            FieldUpdate::Clear => Err(ValidationError::NotClearable(field)),
        }
    }
}

impl<T: Clone + Default> FieldUpdate<T> {
    /// Applies to a field whose cleared state is its default (empty text, no labels).
    pub fn apply_or_default(&self, target: &mut T) {
        match self {
            FieldUpdate::Unchanged => {}
            FieldUpdate::Set(v) => *target = v.clone(),
            FieldUpdate::Clear => *target = T::default(),
        }
    }
}

impl<T: Serialize> FieldUpdate<T> {
    /// The value this update asks for, as it would appear on the entity.
    ///
    /// `cleared` is what the field holds after a `Clear`.
    pub fn requested(&self, cleared: Value) -> Option<Value> {
        match self {
            FieldUpdate::Unchanged => None,
            FieldUpdate::Set(v) => Some(serde_json::to_value(v).unwrap_or(Value::Null)),
            FieldUpdate::Clear => Some(cleared),
        }
    }
}
