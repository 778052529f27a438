use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{EntityId, Scope};
use super::patch::{FieldUpdate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: EntityId,
    pub project_id: EntityId,
    pub name: String,
    #[serde(default)]
    pub order: i32,
}

impl Section {
    pub fn new(project_id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::pending(),
            project_id,
            name: name.into(),
            order: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::sections(&self.project_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty("name"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SectionPatch {
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub name: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub order: FieldUpdate<i32>,
}

impl SectionPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_unchanged() && self.order.is_unchanged()
    }

    pub fn apply(&self, section: &mut Section) -> Result<(), ValidationError> {
        self.name.apply_required(&mut section.name, "name")?;
        self.order.apply_or_default(&mut section.order);
        section.validate()
    }

    pub fn requested_fields(&self) -> Vec<(&'static str, Value)> {
        [
            ("name", self.name.requested(Value::Null)),
            ("order", self.order.requested(Value::from(0))),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}
