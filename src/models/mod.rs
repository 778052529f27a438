mod id;
mod mutation;
mod patch;
mod project;
mod record;
mod section;
mod task;

pub use id::{EntityId, EntityKind, Scope, PENDING_PREFIX};
pub use mutation::{
    Action, Mutation, MutationStatus, NewMutation, Snapshot, SnapshotError, SNAPSHOT_VERSION,
};
pub use patch::{FieldUpdate, ValidationError};
pub use project::{Project, ProjectPatch};
pub use record::{Entity, Patch, Record};
pub use section::{Section, SectionPatch};
pub use task::{Task, TaskPatch, MAX_PRIORITY, MIN_PRIORITY};
