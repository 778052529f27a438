use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::id::{EntityId, Scope};
use super::patch::{FieldUpdate, ValidationError};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: EntityId,
    pub project_id: EntityId,
    #[serde(default)]
    pub section_id: Option<EntityId>,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub due: Option<NaiveDate>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub checked: bool,
}

fn default_priority() -> u8 {
    MIN_PRIORITY
}

impl Task {
    pub fn new(project_id: EntityId, content: impl Into<String>) -> Self {
        Self {
            id: EntityId::pending(),
            project_id,
            section_id: None,
            content: content.into(),
            description: String::new(),
            priority: MIN_PRIORITY,
            due: None,
            labels: Vec::new(),
            checked: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_section(mut self, section_id: EntityId) -> Self {
        self.section_id = Some(section_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_due(mut self, due: NaiveDate) -> Self {
        self.due = Some(due);
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::tasks(&self.project_id)
    }

    /// Open (not completed) tasks make up the active set.
    pub fn is_active(&self) -> bool {
        !self.checked
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::Empty("content"));
        }
        check_priority(self.priority)
    }
}

fn check_priority(priority: u8) -> Result<(), ValidationError> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(ValidationError::Priority(priority))
    }
}

/// Requested changes to a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub content: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub description: FieldUpdate<String>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub priority: FieldUpdate<u8>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub due: FieldUpdate<NaiveDate>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub labels: FieldUpdate<Vec<String>>,
    #[serde(default, skip_serializing_if = "FieldUpdate::is_unchanged")]
    pub section_id: FieldUpdate<EntityId>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_unchanged()
            && self.description.is_unchanged()
            && self.priority.is_unchanged()
            && self.due.is_unchanged()
            && self.labels.is_unchanged()
            && self.section_id.is_unchanged()
    }

    pub fn apply(&self, task: &mut Task) -> Result<(), ValidationError> {
        self.content.apply_required(&mut task.content, "content")?;
        self.description.apply_or_default(&mut task.description);
        self.priority.apply_required(&mut task.priority, "priority")?;
        self.due.apply_optional(&mut task.due);
        self.labels.apply_or_default(&mut task.labels);
        self.section_id.apply_optional(&mut task.section_id);
        task.validate()
    }

    /// Field name and requested value for every field this patch touches.
    pub fn requested_fields(&self) -> Vec<(&'static str, Value)> {
        [
            ("content", self.content.requested(json!(""))),
            ("description", self.description.requested(json!(""))),
            ("priority", self.priority.requested(Value::Null)),
            ("due", self.due.requested(Value::Null)),
            ("labels", self.labels.requested(json!([]))),
            ("section_id", self.section_id.requested(Value::Null)),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}
