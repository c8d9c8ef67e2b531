//! Slot store.
//!
//! A slot is `Ready` (usable), `Writing` (a save is in progress; the
//! previous contents are kept aside), or `Invalid` (a save was interrupted
//! by a crash).  Failed saves put the previous contents back.  The lock is
//! held only for lookups and state flips, never while pages are copied.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::{CheckpointError, Slot};

enum Entry {
    Ready(Arc<Slot>),
    Writing { prior: Option<Arc<Slot>> },
    Invalid,
}

pub struct SlotStore {
    entries: Mutex<BTreeMap<u32, Entry>>,
    budget: usize,
}

impl SlotStore {
    /// A store that may hold `budget` bytes in total (0 = unlimited).
    pub fn new(budget: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            budget,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes held by all slots except `skip`.
    fn used_except(entries: &BTreeMap<u32, Entry>, skip: u32) -> usize {
        entries
            .iter()
            .filter(|(k, _)| **k != skip)
            .map(|(_, e)| match e {
                Entry::Ready(s) | Entry::Writing { prior: Some(s) } => s.size(),
                _ => 0,
            })
            .sum()
    }

    /// Refuse a save of `estimate` bytes into `slot` that would exceed the
    /// budget.  The slot's current contents do not count, since they are
    /// replaced on success.
    pub fn check_budget(&self, slot: u32, estimate: usize) -> Result<(), CheckpointError> {
        if self.budget == 0 {
            return Ok(());
        }
        let used = Self::used_except(&self.lock(), slot);
        let available = self.budget.saturating_sub(used);
        if estimate > available {
            return Err(CheckpointError::StorageExhausted {
                needed: estimate,
                available,
            });
        }
        Ok(())
    }

    /// Mark `slot` as being written.
    pub fn begin_write(&self, slot: u32) -> WriteTicket<'_> {
        let mut entries = self.lock();
        let prior = match entries.remove(&slot) {
            Some(Entry::Ready(s)) => Some(s),
            Some(Entry::Writing { prior }) => prior,
            Some(Entry::Invalid) | None => None,
        };
        entries.insert(slot, Entry::Writing { prior });
        WriteTicket { store: self, slot, done: false }
    }

    /// The checkpoint in `slot`, if it is usable.
    pub fn get(&self, slot: u32) -> Result<Arc<Slot>, CheckpointError> {
        match self.lock().get(&slot) {
            Some(Entry::Ready(s)) => Ok(s.clone()),
            Some(Entry::Invalid) => Err(CheckpointError::SlotInvalid(slot)),
            Some(Entry::Writing { .. }) | None => Err(CheckpointError::UnknownSlot(slot)),
        }
    }

    pub fn contains(&self, slot: u32) -> bool {
        matches!(self.lock().get(&slot), Some(Entry::Ready(_)))
    }

    /// Total bytes held.
    pub fn used(&self) -> usize {
        let entries = self.lock();
        entries
            .values()
            .map(|e| match e {
                Entry::Ready(s) | Entry::Writing { prior: Some(s) } => s.size(),
                _ => 0,
            })
            .sum()
    }

    pub fn clear(&self, slot: u32) {
        self.lock().remove(&slot);
    }
}

/// An in-progress write.  Dropping it without [`commit`](Self::commit) or
/// [`abort`](Self::abort) means the save died halfway: the slot is marked
/// invalid.
pub struct WriteTicket<'a> {
    store: &'a SlotStore,
    slot: u32,
    done: bool,
}

impl WriteTicket<'_> {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn commit(mut self, contents: Slot) {
        self.done = true;
        let size = contents.size();
        self.store.lock().insert(self.slot, Entry::Ready(Arc::new(contents)));
        debug!("slot {} committed ({} bytes)", self.slot, size);
    }

    /// The save failed cleanly: put the previous contents back.
    pub fn abort(mut self) {
        self.done = true;
        let mut entries = self.store.lock();
        match entries.remove(&self.slot) {
            Some(Entry::Writing { prior: Some(s) }) => {
                entries.insert(self.slot, Entry::Ready(s));
            }
            Some(Entry::Writing { prior: None }) | None => {}
            Some(other) => {
                entries.insert(self.slot, other);
            }
        }
    }
}

impl Drop for WriteTicket<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.store.lock().insert(self.slot, Entry::Invalid);
        }
    }
}
