//! Ordered registry of suspendable activities.
//!
//! Registrations are kept in a `BTreeMap` keyed by `(priority, id)`, so a
//! range scan yields one execution group in registration order. The registry
//! itself is not synchronized; the controller owns it behind a mutex and only
//! ever hands out owned snapshots, so traversals never iterate live data.

use crate::activity::{SuspendPriority, SuspendableActivity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Identifies one registration. Ids increase monotonically and break ties
/// within an execution group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered activity as seen by a traversal.
#[derive(Clone)]
pub(crate) struct RegisteredActivity {
    pub id: RegistrationId,
    pub priority: SuspendPriority,
    pub activity: Arc<dyn SuspendableActivity>,
}

impl fmt::Debug for RegisteredActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredActivity")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("name", &self.activity.name())
            .finish()
    }
}

/// One execution group, copied out of the registry when the group begins.
#[derive(Debug)]
pub(crate) struct GroupSnapshot {
    pub priority: SuspendPriority,
    pub members: Vec<RegisteredActivity>,
}

#[derive(Default)]
pub(crate) struct ActivityRegistry {
    entries: BTreeMap<(SuspendPriority, RegistrationId), Arc<dyn SuspendableActivity>>,
    next_id: u64,
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("len", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The id the next registration will receive. Everything registered
    /// before this call has a strictly smaller id.
    pub fn cutoff(&self) -> RegistrationId {
        RegistrationId(self.next_id)
    }

    pub fn contains(&self, activity: &Arc<dyn SuspendableActivity>) -> bool {
        self.find(address_of(activity)).is_some()
    }

    /// Register `activity` under `priority`. Returns `None` if this exact
    /// instance is already registered.
    pub fn insert(
        &mut self,
        activity: Arc<dyn SuspendableActivity>,
        priority: SuspendPriority,
    ) -> Option<RegistrationId> {
        if self.contains(&activity) {
            return None;
        }
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        self.entries.insert((priority, id), activity);
        Some(id)
    }

    pub fn remove(&mut self, id: RegistrationId) -> Option<RegisteredActivity> {
        let key = self.entries.keys().find(|(_, entry_id)| *entry_id == id).copied()?;
        self.entries
            .remove(&key)
            .map(|activity| RegisteredActivity {
                id,
                priority: key.0,
                activity,
            })
    }

    /// Remove the registration of the instance living at `address`.
    pub fn remove_activity(&mut self, address: *const ()) -> Option<RegisteredActivity> {
        let id = self.find(address)?;
        self.remove(id)
    }

    /// Snapshot of the group that follows `after` in traversal order.
    ///
    /// Ascending order is used for prepare and suspend, descending for
    /// resume. Only registrations older than `cutoff` are considered; a group
    /// whose members are all newer is skipped.
    pub fn next_group(
        &self,
        after: Option<SuspendPriority>,
        descending: bool,
        cutoff: RegistrationId,
    ) -> Option<GroupSnapshot> {
        let mut search_from = after;
        loop {
            let priority = self.next_priority(search_from, descending)?;
            let members: Vec<RegisteredActivity> = self
                .group_range(priority)
                .filter(|((_, id), _)| *id < cutoff)
                .map(|((priority, id), activity)| RegisteredActivity {
                    id: *id,
                    priority: *priority,
                    activity: activity.clone(),
                })
                .collect();
            if !members.is_empty() {
                return Some(GroupSnapshot { priority, members });
            }
            search_from = Some(priority);
        }
    }

    fn find(&self, address: *const ()) -> Option<RegistrationId> {
        self.entries
            .iter()
            .find(|(_, registered)| address_of(registered) == address)
            .map(|((_, id), _)| *id)
    }

    fn next_priority(
        &self,
        after: Option<SuspendPriority>,
        descending: bool,
    ) -> Option<SuspendPriority> {
        let key = match (after, descending) {
            (None, false) => self.entries.keys().next(),
            (None, true) => self.entries.keys().next_back(),
            (Some(after), false) => self
                .entries
                .range((
                    Bound::Excluded((after, RegistrationId(u64::MAX))),
                    Bound::Unbounded,
                ))
                .next()
                .map(|(key, _)| key),
            (Some(after), true) => self
                .entries
                .range(..(after, RegistrationId(0)))
                .next_back()
                .map(|(key, _)| key),
        };
        key.map(|(priority, _)| *priority)
    }

    fn group_range(
        &self,
        priority: SuspendPriority,
    ) -> impl Iterator<Item = (&(SuspendPriority, RegistrationId), &Arc<dyn SuspendableActivity>)>
    {
        self.entries
            .range((priority, RegistrationId(0))..=(priority, RegistrationId(u64::MAX)))
    }
}

/// Address of the activity instance. Vtable pointers are not guaranteed
/// unique, so identity is the data address alone.
pub(crate) fn address_of<A: SuspendableActivity + ?Sized>(activity: &Arc<A>) -> *const () {
    Arc::as_ptr(activity).cast::<()>()
}
