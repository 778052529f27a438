//! In-process server used by tests.
//!
//! Honors idempotency keys, assigns sequential IDs (`P100`, `T101`, ...) and
//! can be told to fail specific calls, either before or after the change has
//! been applied (a lost response).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{BatchCommand, BatchResponse, Listing, RemoteClient, RemoteError};
use crate::models::{Action, EntityId, EntityKind, Patch, Record, Scope};

const FIRST_ID: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Get,
    Create,
    Update,
    Close,
    Reopen,
    Delete,
    Batch,
}

#[derive(Debug)]
enum Fault {
    Before(RemoteError),
    After(RemoteError),
}

#[derive(Debug)]
struct State {
    records: Vec<Record>,
    next_id: u64,
    /// Result of each applied key; `None` for actions that return nothing.
    applied: HashMap<Uuid, Option<Record>>,
    effects: usize,
    faults: HashMap<Op, VecDeque<Fault>>,
    calls: Vec<Op>,
    version: u64,
}

pub struct MemoryRemote {
    state: Mutex<State>,
    batch: bool,
    latency: Duration,
    list_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                records: Vec::new(),
                next_id: FIRST_ID,
                applied: HashMap::new(),
                effects: 0,
                faults: HashMap::new(),
                calls: Vec::new(),
                version: 0,
            }),
            batch: false,
            latency: Duration::ZERO,
            list_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Accept batched submissions.
    pub fn with_batch(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Delay every call, to widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Hold every list reply back for `delay` after its contents are taken,
    /// so other calls can land while it is in transit.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Store a record as-is, without counting it as an applied effect.
    pub fn seed(&self, record: impl Into<Record>) {
        let record = record.into();
        let mut state = self.lock();
        match state.position(record.kind(), record.id()) {
            Some(idx) => state.records[idx] = record,
            None => state.records.push(record),
        }
        state.version += 1;
    }

    /// Change a record the way another client would.
    pub fn edit(&self, kind: EntityKind, id: &EntityId, f: impl FnOnce(&mut Record)) {
        let mut state = self.lock();
        if let Some(idx) = state.position(kind, id) {
            f(&mut state.records[idx]);
            state.version += 1;
        }
    }

    pub fn record(&self, kind: EntityKind, id: &EntityId) -> Option<Record> {
        let state = self.lock();
        state.position(kind, id).map(|idx| state.records[idx].clone())
    }

    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    /// Number of distinct changes applied through the client API.
    pub fn effects(&self) -> usize {
        self.lock().effects
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Fail the next `op` call without applying it.
    pub fn fail_next(&self, op: Op, error: RemoteError) {
        self.push_fault(op, Fault::Before(error));
    }

    /// Apply the next `op` call, then report `error` as if the response was lost.
    pub fn fail_after_apply(&self, op: Op, error: RemoteError) {
        self.push_fault(op, Fault::After(error));
    }

    fn push_fault(&self, op: Op, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call<T>(
        &self,
        op: Op,
        apply: impl FnOnce(&mut State) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = {
            let mut state = self.lock();
            state.calls.push(op);
            let fault = state.faults.get_mut(&op).and_then(VecDeque::pop_front);
            match fault {
                Some(Fault::Before(e)) => Err(e),
                Some(Fault::After(e)) => apply(&mut *state).and(Err(e)),
                None => apply(&mut *state),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn not_found(kind: EntityKind, id: &EntityId) -> RemoteError {
    RemoteError::NotFound(format!("{} {}", kind, id))
}

impl State {
    fn position(&self, kind: EntityKind, id: &EntityId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.kind() == kind && r.id() == id)
    }

    fn find(&self, kind: EntityKind, id: &EntityId) -> Result<usize, RemoteError> {
        self.position(kind, id).ok_or_else(|| not_found(kind, id))
    }

    fn record_effect(&mut self, key: Uuid, result: Option<Record>) {
        self.applied.insert(key, result);
        self.effects += 1;
        self.version += 1;
    }

    fn cursor(&self) -> String {
        format!("v{}", self.version)
    }

    fn list(&self, scope: &Scope) -> Listing {
        let items = self
            .records
            .iter()
            .filter(|r| r.scope() == *scope)
            .filter(|r| !matches!(r, Record::Task(t) if t.checked))
            .cloned()
            .collect();
        Listing {
            items,
            cursor: Some(self.cursor()),
        }
    }

    fn create(&mut self, record: &Record, key: Uuid) -> Result<Record, RemoteError> {
        if let Some(previous) = self.applied.get(&key) {
            return previous
                .clone()
                .ok_or_else(|| RemoteError::Protocol(format!("key {} reused", key)));
        }
        record
            .validate()
            .map_err(|e| RemoteError::Validation(e.to_string()))?;

        let prefix = match record.kind() {
            EntityKind::Project => "P",
            EntityKind::Section => "S",
            EntityKind::Task => "T",
        };
        let id = EntityId::new(format!("{}{}", prefix, self.next_id));
        self.next_id += 1;

        let created = record.clone().with_id(id);
        self.records.push(created.clone());
        self.record_effect(key, Some(created.clone()));
        Ok(created)
    }

    fn update(&mut self, id: &EntityId, patch: &Patch, key: Uuid) -> Result<Record, RemoteError> {
        if let Some(previous) = self.applied.get(&key) {
            return previous
                .clone()
                .ok_or_else(|| RemoteError::Protocol(format!("key {} reused", key)));
        }
        let idx = self.find(patch.kind(), id)?;
        let updated = patch
            .apply(&self.records[idx])
            .map_err(|e| RemoteError::Validation(e.to_string()))?;
        self.records[idx] = updated.clone();
        self.record_effect(key, Some(updated.clone()));
        Ok(updated)
    }

    fn set_checked(&mut self, id: &EntityId, checked: bool, key: Uuid) -> Result<(), RemoteError> {
        if self.applied.contains_key(&key) {
            return Ok(());
        }
        let idx = self.find(EntityKind::Task, id)?;
        if let Record::Task(task) = &mut self.records[idx] {
            task.checked = checked;
        }
        self.record_effect(key, None);
        Ok(())
    }

    fn delete(&mut self, kind: EntityKind, id: &EntityId, key: Uuid) -> Result<(), RemoteError> {
        if self.applied.contains_key(&key) {
            return Ok(());
        }
        let idx = self.find(kind, id)?;
        self.records.remove(idx);
        if kind == EntityKind::Project {
            // Children go with their project.
            self.records.retain(|r| match r {
                Record::Task(t) => t.project_id != *id,
                Record::Section(s) => s.project_id != *id,
                Record::Project(_) => true,
            });
        }
        self.record_effect(key, None);
        Ok(())
    }

    fn apply_command(
        &mut self,
        command: &BatchCommand,
        placeholder_ids: &mut HashMap<EntityId, EntityId>,
    ) -> Result<(), RemoteError> {
        let key = command.idempotency_key;
        let id = &command.entity_id;
        match &command.action {
            Action::Create(record) => {
                let created = self.create(record, key)?;
                placeholder_ids.insert(id.clone(), created.id().clone());
                Ok(())
            }
            Action::Update(patch) => self.update(id, patch, key).map(|_| ()),
            Action::Close => self.set_checked(id, true, key),
            Action::Reopen => self.set_checked(id, false, key),
            Action::Delete => self.delete(command.kind, id, key),
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn list(&self, scope: &Scope) -> Result<Listing, RemoteError> {
        let listing = self.call(Op::List, |state| Ok(state.list(scope))).await;
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        listing
    }

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Record, RemoteError> {
        self.call(Op::Get, |state| {
            let idx = state.find(kind, id)?;
            Ok(state.records[idx].clone())
        })
        .await
    }

    async fn create(&self, record: &Record, key: Uuid) -> Result<Record, RemoteError> {
        self.call(Op::Create, |state| state.create(record, key)).await
    }

    async fn update(
        &self,
        id: &EntityId,
        patch: &Patch,
        key: Uuid,
    ) -> Result<Record, RemoteError> {
        self.call(Op::Update, |state| state.update(id, patch, key))
            .await
    }

    async fn close(&self, id: &EntityId, key: Uuid) -> Result<(), RemoteError> {
        self.call(Op::Close, |state| state.set_checked(id, true, key))
            .await
    }

    async fn reopen(&self, id: &EntityId, key: Uuid) -> Result<(), RemoteError> {
        self.call(Op::Reopen, |state| state.set_checked(id, false, key))
            .await
    }

    async fn delete(
        &self,
        kind: EntityKind,
        id: &EntityId,
        key: Uuid,
    ) -> Result<(), RemoteError> {
        self.call(Op::Delete, |state| state.delete(kind, id, key))
            .await
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn submit_batch(&self, commands: &[BatchCommand]) -> Result<BatchResponse, RemoteError> {
        if !self.batch {
            return Err(RemoteError::BatchUnsupported);
        }
        self.call(Op::Batch, |state| {
            let mut response = BatchResponse::default();
            for command in commands {
                let status = state.apply_command(command, &mut response.placeholder_ids);
                response.statuses.insert(command.idempotency_key, status);
            }
            response.cursor = Some(state.cursor());
            Ok(response)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Project, Task};

    fn project() -> Project {
        Project::new("Inbox").with_id("P1")
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let remote = MemoryRemote::new();
        remote.seed(project());

        let task = Task::new(EntityId::new("P1"), "Buy milk");
        let created = remote
            .create(&task.into(), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(created.id(), &EntityId::new("T100"));
        let listing = remote.list(&Scope::tasks(&EntityId::new("P1"))).await.unwrap();
        assert_eq!(listing.items, vec![created]);
        assert!(listing.cursor.is_some());
    }

    #[tokio::test]
    async fn test_same_key_applies_once() {
        let remote = MemoryRemote::new();
        let record: Record = Task::new(EntityId::new("P1"), "Buy milk").into();
        let key = Uuid::new_v4();

        let first = remote.create(&record, key).await.unwrap();
        let second = remote.create(&record, key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(remote.effects(), 1);
        assert_eq!(remote.records().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_after_apply_then_resend() {
        let remote = MemoryRemote::new();
        remote.seed(Task::new(EntityId::new("P1"), "Buy milk").with_id("T1"));
        remote.fail_after_apply(Op::Close, RemoteError::Timeout);
        let key = Uuid::new_v4();

        let err = remote.close(&EntityId::new("T1"), key).await.unwrap_err();
        assert_eq!(err, RemoteError::Timeout);
        remote.close(&EntityId::new("T1"), key).await.unwrap();

        assert_eq!(remote.effects(), 1);
        assert_eq!(remote.calls(Op::Close), 2);
        // Closed tasks drop out of the listing.
        let listing = remote.list(&Scope::tasks(&EntityId::new("P1"))).await.unwrap();
        assert!(listing.items.is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_does_not_apply() {
        let remote = MemoryRemote::new();
        remote.fail_next(
            Op::Create,
            RemoteError::Validation("nope".into()),
        );

        let err = remote
            .create(&project().into(), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Validation(_)));
        assert!(remote.records().is_empty());
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let remote = MemoryRemote::new();
        let err = remote
            .close(&EntityId::new("T404"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_maps_placeholders() {
        let remote = MemoryRemote::new().with_batch();
        remote.seed(project());
        let task = Task::new(EntityId::new("P1"), "Buy milk");
        let create = BatchCommand {
            idempotency_key: Uuid::new_v4(),
            kind: EntityKind::Task,
            entity_id: task.id.clone(),
            action: Action::Create(task.clone().into()),
        };
        let missing = BatchCommand {
            idempotency_key: Uuid::new_v4(),
            kind: EntityKind::Task,
            entity_id: EntityId::new("T404"),
            action: Action::Close,
        };

        let response = remote
            .submit_batch(&[create.clone(), missing.clone()])
            .await
            .unwrap();

        assert_eq!(response.placeholder_ids[&task.id], EntityId::new("T100"));
        assert_eq!(response.statuses[&create.idempotency_key], Ok(()));
        assert!(matches!(
            response.statuses[&missing.idempotency_key],
            Err(RemoteError::NotFound(_))
        ));
    }
}
