use dashmap::DashMap;
use std::collections::HashMap;

/// Maps (owner, device) to a live session handle.
///
/// Pure bookkeeping with no I/O. Every mutation touches a single owner
/// bucket under its shard lock, so dispatch workers and lifecycle handlers
/// can interleave freely; `put` is last-writer-wins.
pub struct SessionRegistry<H> {
    owners: DashMap<String, HashMap<String, H>>,
}

impl<H: Clone> SessionRegistry<H> {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
        }
    }

    /// Insert or replace, returning the previous handle
    pub fn put(&self, owner_id: &str, device_id: &str, handle: H) -> Option<H> {
        self.owners
            .entry(owner_id.to_string())
            .or_default()
            .insert(device_id.to_string(), handle)
    }

    pub fn get(&self, owner_id: &str, device_id: &str) -> Option<H> {
        self.owners
            .get(owner_id)
            .and_then(|devices| devices.get(device_id).cloned())
    }

    pub fn remove(&self, owner_id: &str, device_id: &str) -> Option<H> {
        self.remove_if(owner_id, device_id, |_| true)
    }

    /// Remove only if `predicate` accepts the current handle. Prunes the
    /// owner bucket when its last device goes.
    pub fn remove_if(
        &self,
        owner_id: &str,
        device_id: &str,
        predicate: impl FnOnce(&H) -> bool,
    ) -> Option<H> {
        let removed = {
            let mut devices = self.owners.get_mut(owner_id)?;
            match devices.get(device_id) {
                Some(handle) if predicate(handle) => devices.remove(device_id),
                _ => None,
            }
        };

        if removed.is_some() {
            self.owners.remove_if(owner_id, |_, devices| devices.is_empty());
        }
        removed
    }

    /// Device ids with a live session for this owner, sorted
    pub fn list(&self, owner_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .owners
            .get(owner_id)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn contains_owner(&self, owner_id: &str) -> bool {
        self.owners.contains_key(owner_id)
    }

    /// Total live sessions across all owners
    pub fn len(&self) -> usize {
        self.owners.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Clone> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
