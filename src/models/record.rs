//! Kind-erased entity and change wrappers used by the cache and the queue.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::{EntityId, EntityKind, Scope};
use super::patch::{FieldUpdate, ValidationError};
use super::project::{Project, ProjectPatch};
use super::section::{Section, SectionPatch};
use super::task::{Task, TaskPatch};

/// Any cached entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Project(Project),
    Section(Section),
    Task(Task),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Project(_) => EntityKind::Project,
            Record::Section(_) => EntityKind::Section,
            Record::Task(_) => EntityKind::Task,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            Record::Project(p) => &p.id,
            Record::Section(s) => &s.id,
            Record::Task(t) => &t.id,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Record::Project(p) => p.scope(),
            Record::Section(s) => s.scope(),
            Record::Task(t) => t.scope(),
        }
    }

    /// The same entity under another ID (temp-ID resolution).
    pub fn with_id(self, id: EntityId) -> Record {
        match self {
            Record::Project(p) => Record::Project(p.with_id(id)),
            Record::Section(s) => Record::Section(s.with_id(id)),
            Record::Task(t) => Record::Task(t.with_id(id)),
        }
    }

    /// Parent entities this record points at.
    pub fn parents(&self) -> Vec<(EntityKind, &EntityId)> {
        match self {
            Record::Project(_) => Vec::new(),
            Record::Section(s) => vec![(EntityKind::Project, &s.project_id)],
            Record::Task(t) => std::iter::once((EntityKind::Project, &t.project_id))
                .chain(t.section_id.as_ref().map(|id| (EntityKind::Section, id)))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Record::Project(p) => p.validate(),
            Record::Section(s) => s.validate(),
            Record::Task(t) => t.validate(),
        }
    }

    /// Field values keyed by their serialized names.
    pub fn fields(&self) -> Map<String, Value> {
        let value = match self {
            Record::Project(p) => serde_json::to_value(p),
            Record::Section(s) => serde_json::to_value(s),
            Record::Task(t) => serde_json::to_value(t),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Typed view over [`Record`].
pub trait Entity: Sized {
    const KIND: EntityKind;

    fn from_record(record: Record) -> Option<Self>;
    fn into_record(self) -> Record;
    fn assign_id(self, id: EntityId) -> Self;
}

macro_rules! impl_entity {
    ($ty:ident, $kind:ident) => {
        impl Entity for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$kind(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_record(self) -> Record {
                Record::$kind(self)
            }

            fn assign_id(self, id: EntityId) -> Self {
                self.with_id(id)
            }
        }

        impl From<$ty> for Record {
            fn from(value: $ty) -> Self {
                Record::$kind(value)
            }
        }
    };
}

impl_entity!(Project, Project);
impl_entity!(Section, Section);
impl_entity!(Task, Task);

/// A partial update to any entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Patch {
    Project(ProjectPatch),
    Section(SectionPatch),
    Task(TaskPatch),
}

impl Patch {
    pub fn kind(&self) -> EntityKind {
        match self {
            Patch::Project(_) => EntityKind::Project,
            Patch::Section(_) => EntityKind::Section,
            Patch::Task(_) => EntityKind::Task,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Patch::Project(p) => p.is_empty(),
            Patch::Section(p) => p.is_empty(),
            Patch::Task(p) => p.is_empty(),
        }
    }

    /// Returns the patched copy of `record`; the input is left alone.
    pub fn apply(&self, record: &Record) -> Result<Record, ValidationError> {
        let mut record = record.clone();
        match (self, &mut record) {
            (Patch::Project(patch), Record::Project(p)) => patch.apply(p)?,
            (Patch::Section(patch), Record::Section(s)) => patch.apply(s)?,
            (Patch::Task(patch), Record::Task(t)) => patch.apply(t)?,
            (patch, entity) => {
                return Err(ValidationError::KindMismatch {
                    patch: patch.kind().as_str(),
                    entity: entity.kind().as_str(),
                })
            }
        }
        Ok(record)
    }

    pub fn requested_fields(&self) -> Vec<(&'static str, Value)> {
        match self {
            Patch::Project(p) => p.requested_fields(),
            Patch::Section(p) => p.requested_fields(),
            Patch::Task(p) => p.requested_fields(),
        }
    }

    /// New parents this patch would point the entity at.
    pub fn parents(&self) -> Vec<(EntityKind, &EntityId)> {
        match self {
            Patch::Task(TaskPatch {
                section_id: FieldUpdate::Set(id),
                ..
            }) => vec![(EntityKind::Section, id)],
            _ => Vec::new(),
        }
    }
}

impl From<TaskPatch> for Patch {
    fn from(value: TaskPatch) -> Self {
        Patch::Task(value)
    }
}

impl From<ProjectPatch> for Patch {
    fn from(value: ProjectPatch) -> Self {
        Patch::Project(value)
    }
}

impl From<SectionPatch> for Patch {
    fn from(value: SectionPatch) -> Self {
        Patch::Section(value)
    }
}
