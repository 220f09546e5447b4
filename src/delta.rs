//! Delta notification buffering and piece extraction.
//!
//! Notifications arrive faster than they can be processed, so the HTTP
//! handler only appends them to a [`DeltaBuffer`]; a processing run later
//! drains everything accumulated so far in one step.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::Changeset;

/// Append-only queue of changesets, drained atomically.
#[derive(Debug, Default)]
pub struct DeltaBuffer {
    pending: Mutex<Vec<Changeset>>,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Changeset>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a delivered batch. Batches are concatenated, never merged.
    pub fn push(&self, changesets: Vec<Changeset>) {
        self.lock().extend(changesets);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Changeset> {
        std::mem::take(&mut *self.lock())
    }
}

/// Subjects typed as a piece by the inserts of `changesets`, in first-seen
/// order without duplicates. Deletes are ignored.
pub fn candidate_pieces(changesets: &[Changeset]) -> Vec<String> {
    let mut seen = HashSet::new();
    changesets
        .iter()
        .flat_map(|c| c.inserts.iter())
        .filter(|t| t.declares_piece())
        .filter(|t| seen.insert(t.subject.value.as_str()))
        .map(|t| t.subject.value.clone())
        .collect()
}
