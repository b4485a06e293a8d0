//! Grouped storage for run-scoped data values.
//!
//! Handlers that produce large or transient values park them in a
//! [`DataStore`] instead of threading them through edge values. Values are
//! organized into groups, usually one per run, so a whole run's data can be
//! serialized or released at once.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one group of stored values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(Uuid);

impl GroupId {
    fn new() -> Self {
        GroupId(Uuid::new_v4())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one stored value within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataHandle(Uuid);

impl std::fmt::Display for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum DataStoreError {
    #[error("no data group is active")]
    #[diagnostic(
        code(flowboard::data::no_group),
        help("Call `create_group` before storing values.")
    )]
    NoActiveGroup,

    #[error("data group {0} not found")]
    #[diagnostic(code(flowboard::data::unknown_group))]
    UnknownGroup(GroupId),

    #[error("data handle {0} not found")]
    #[diagnostic(code(flowboard::data::unknown_handle))]
    UnknownHandle(DataHandle),
}

/// Run-scoped value storage, organized into groups.
///
/// The store is synchronous; implementations are expected to be cheap,
/// in-process registries. The most recently created group is the default
/// target for [`store`](DataStore::store).
pub trait DataStore: Send + Sync {
    /// Open a new group and make it the default.
    fn create_group(&self) -> GroupId;

    /// Store a value in the default group.
    fn store(&self, value: Value) -> Result<DataHandle, DataStoreError>;

    /// Replace the stored value behind a handle.
    fn replace_data_parts(&self, handle: DataHandle, value: Value) -> Result<(), DataStoreError>;

    /// Snapshot every value in a group, in insertion order.
    fn serialize_group(&self, group: GroupId) -> Result<Vec<Value>, DataStoreError>;

    /// Drop a group and everything in it.
    fn release_group(&self, group: GroupId);

    /// Drop all groups.
    fn release_all(&self);
}

#[derive(Default)]
struct Groups {
    order: Vec<GroupId>,
    entries: FxHashMap<GroupId, Vec<(DataHandle, Value)>>,
}

/// The built-in in-process store.
#[derive(Default)]
pub struct InMemoryStore {
    groups: Mutex<Groups>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for InMemoryStore {
    fn create_group(&self) -> GroupId {
        let id = GroupId::new();
        let mut groups = self.groups.lock();
        groups.order.push(id);
        groups.entries.insert(id, Vec::new());
        id
    }

    fn store(&self, value: Value) -> Result<DataHandle, DataStoreError> {
        let mut groups = self.groups.lock();
        let current = *groups.order.last().ok_or(DataStoreError::NoActiveGroup)?;
        let handle = DataHandle(Uuid::new_v4());
        groups
            .entries
            .get_mut(&current)
            .ok_or(DataStoreError::UnknownGroup(current))?
            .push((handle, value));
        Ok(handle)
    }

    fn replace_data_parts(&self, handle: DataHandle, value: Value) -> Result<(), DataStoreError> {
        let mut groups = self.groups.lock();
        for entries in groups.entries.values_mut() {
            if let Some(slot) = entries.iter_mut().find(|(h, _)| *h == handle) {
                slot.1 = value;
                return Ok(());
            }
        }
        Err(DataStoreError::UnknownHandle(handle))
    }

    fn serialize_group(&self, group: GroupId) -> Result<Vec<Value>, DataStoreError> {
        let groups = self.groups.lock();
        groups
            .entries
            .get(&group)
            .map(|entries| entries.iter().map(|(_, value)| value.clone()).collect())
            .ok_or(DataStoreError::UnknownGroup(group))
    }

    fn release_group(&self, group: GroupId) {
        let mut groups = self.groups.lock();
        groups.order.retain(|id| *id != group);
        groups.entries.remove(&group);
    }

    fn release_all(&self) {
        let mut groups = self.groups.lock();
        groups.order.clear();
        groups.entries.clear();
    }
}
