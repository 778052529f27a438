use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{EntityId, Scope};
use super::patch::{FieldUpdate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::pending(),
            name: name.into(),
            color: None,
            is_favorite: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::projects()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty("name"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectPatch {
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub name: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub color: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub is_favorite: FieldUpdate<bool>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_unchanged() && self.color.is_unchanged() && self.is_favorite.is_unchanged()
    }

    pub fn apply(&self, project: &mut Project) -> Result<(), ValidationError> {
        self.name.apply_required(&mut project.name, "name")?;
        self.color.apply_optional(&mut project.color);
        self.is_favorite.apply_or_default(&mut project.is_favorite);
        project.validate()
    }

    pub fn requested_fields(&self) -> Vec<(&'static str, Value)> {
        [
            ("name", self.name.requested(Value::Null)),
            ("color", self.color.requested(Value::Null)),
            ("is_favorite", self.is_favorite.requested(Value::Bool(false))),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}
