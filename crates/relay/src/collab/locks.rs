// Advisory single-holder edit locks over named fields.

use std::collections::BTreeMap;

use chrono::Utc;
use huddle_common::types::{EditLockInfo, Identity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// The requester already held the lock.
    AlreadyHeld,
    Conflict { holder: EditLockInfo },
}

impl LockOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Conflict { .. })
    }
}

/// Field key to holder. A field is either unlocked (absent) or locked by
/// exactly one identity.
#[derive(Debug, Clone, Default)]
pub struct EditLockTable {
    locks: BTreeMap<String, EditLockInfo>,
}

impl EditLockTable {
    /// Lock `field` for `identity` unless another identity holds it. A
    /// conflict leaves the table untouched.
    pub fn acquire(&mut self, field: &str, identity: &Identity) -> LockOutcome {
        match self.locks.get(field) {
            Some(holder) if holder.identity_id != identity.id => {
                LockOutcome::Conflict { holder: holder.clone() }
            }
            Some(_) => LockOutcome::AlreadyHeld,
            None => {
                self.locks.insert(
                    field.to_string(),
                    EditLockInfo {
                        identity_id: identity.id.clone(),
                        display_name: identity.display_name.clone(),
                        acquired_at: Utc::now(),
                    },
                );
                LockOutcome::Acquired
            }
        }
    }

    /// Unlock `field` if `identity_id` holds it. Returns whether a lock was
    /// released.
    pub fn release(&mut self, field: &str, identity_id: &str) -> bool {
        match self.locks.get(field) {
            Some(holder) if holder.identity_id == identity_id => {
                self.locks.remove(field);
                true
            }
            _ => false,
        }
    }

    /// Release every field held by `identity_id`, returning the field keys.
    pub fn release_holder(&mut self, identity_id: &str) -> Vec<String> {
        let fields: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, holder)| holder.identity_id == identity_id)
            .map(|(field, _)| field.clone())
            .collect();
        for field in &fields {
            self.locks.remove(field);
        }
        fields
    }

    pub fn holder(&self, field: &str) -> Option<&EditLockInfo> {
        self.locks.get(field)
    }

    pub fn snapshot(&self) -> BTreeMap<String, EditLockInfo> {
        self.locks.clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
