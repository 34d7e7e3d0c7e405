// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
};

use strum_macros::{Display, EnumString};

use crate::{id::OperationId, options::Priority};

/// Order in which operations of the same priority are admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionOrder {
    #[default]
    Fifo,
    Lifo,
}

/// Position of a queued item. Sorting ascending yields admission order:
/// highest tier first, then by arrival (reversed for LIFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    tier:    Reverse<Priority>,
    ordinal: u64,
}

/// Priority scheduler bounding how many operations execute at once.
///
/// The queue only does bookkeeping: every call that can free a slot returns
/// the items it admitted, and the caller starts them.
#[derive(Debug)]
pub(crate) struct OperationQueue<T> {
    order:          ExecutionOrder,
    max_concurrent: usize,
    suspended:      bool,
    next_seq:       u64,
    queued:         BTreeMap<Slot, (OperationId, T)>,
    slots:          HashMap<OperationId, Slot>,
    running:        HashSet<OperationId>,
}

pub(crate) type Admitted<T> = Vec<(OperationId, T)>;

impl<T> OperationQueue<T> {
    pub(crate) fn new(order: ExecutionOrder, max_concurrent: usize) -> Self {
        Self {
            order,
            max_concurrent: max_concurrent.max(1),
            suspended: false,
            next_seq: 0,
            queued: BTreeMap::new(),
            slots: HashMap::new(),
            running: HashSet::new(),
        }
    }

    fn ordinal(&self, seq: u64) -> u64 {
        match self.order {
            ExecutionOrder::Fifo => seq,
            ExecutionOrder::Lifo => u64::MAX - seq,
        }
    }

    pub(crate) fn enqueue(&mut self, id: OperationId, priority: Priority, item: T) -> Admitted<T> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = Slot {
            tier:    Reverse(priority),
            ordinal: self.ordinal(seq),
        };
        self.queued.insert(slot, (id, item));
        self.slots.insert(id, slot);
        self.pump()
    }

    /// Admit queued items while slots are free and the queue is not
    /// suspended.
    pub(crate) fn pump(&mut self) -> Admitted<T> {
        let mut admitted = Vec::new();
        while !self.suspended && self.running.len() < self.max_concurrent {
            let Some((_, (id, item))) = self.queued.pop_first() else {
                break;
            };
            self.slots.remove(&id);
            self.running.insert(id);
            admitted.push((id, item));
        }
        admitted
    }

    /// Remove `id` if it is still waiting. Running items are untouched.
    pub(crate) fn cancel(&mut self, id: OperationId) -> Option<T> {
        let slot = self.slots.remove(&id)?;
        self.queued.remove(&slot).map(|(_, item)| item)
    }

    /// Forget `id`, queued or running, and refill the freed slot.
    pub(crate) fn finish(&mut self, id: OperationId) -> Admitted<T> {
        if self.cancel(id).is_none() {
            self.running.remove(&id);
        }
        self.pump()
    }

    /// Move a queued item to another tier, keeping its arrival position
    /// within that tier. Running items are left alone.
    pub(crate) fn reprioritize(&mut self, id: OperationId, priority: Priority) -> bool {
        let Some(slot) = self.slots.get(&id).copied() else {
            return false;
        };
        if slot.tier == Reverse(priority) {
            return false;
        }
        let Some(entry) = self.queued.remove(&slot) else {
            return false;
        };
        let moved = Slot {
            tier: Reverse(priority),
            ..slot
        };
        self.queued.insert(moved, entry);
        self.slots.insert(id, moved);
        true
    }

    /// Empty the queue. Returns the items that never started; running ids
    /// are forgotten.
    pub(crate) fn drain(&mut self) -> Vec<(OperationId, T)> {
        self.slots.clear();
        self.running.clear();
        std::mem::take(&mut self.queued).into_values().collect()
    }

    pub(crate) const fn suspend(&mut self) { self.suspended = true; }

    pub(crate) fn resume(&mut self) -> Admitted<T> {
        self.suspended = false;
        self.pump()
    }

    pub(crate) fn set_max_concurrent(&mut self, max_concurrent: usize) -> Admitted<T> {
        self.max_concurrent = max_concurrent.max(1);
        self.pump()
    }

    pub(crate) const fn is_suspended(&self) -> bool { self.suspended }

    pub(crate) const fn max_concurrent(&self) -> usize { self.max_concurrent }

    pub(crate) fn running_count(&self) -> usize { self.running.len() }

    pub(crate) fn queued_count(&self) -> usize { self.queued.len() }

    /// Queued plus running.
    pub(crate) fn current_count(&self) -> usize { self.queued.len() + self.running.len() }
}
