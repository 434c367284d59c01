// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Correlation table for in-flight cross-shard transfers.
//!
//! Pairs a monotonically increasing id allocator with a concurrent map of
//! [`CrossShardContext`]s keyed by [`CorrelationId`].

use crate::base::CorrelationId;
use crate::transfer::{CrossShardContext, TransferRequest};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A thread-safe context table with a unique id allocator.
///
/// Each [`DashMap`] entry is guarded by its shard lock, so the
/// look-up/mark/copy sequence in [`mark_step1_completed`](Self::mark_step1_completed)
/// is atomic with respect to [`release`](Self::release).
#[derive(Debug)]
pub struct CorrelationTable {
    contexts: DashMap<CorrelationId, CrossShardContext>,
    next_id: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Hands out a fresh id. Ids start at 1 and are never reused.
    pub fn allocate(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Stores the context for a Step-1 request under its correlation id.
    ///
    /// Returns `false` (and leaves the table untouched) if the id is taken.
    pub fn insert(&self, request: TransferRequest) -> bool {
        match self.contexts.entry(request.correlation_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(CrossShardContext::new(request));
                true
            }
        }
    }

    /// Marks Step-1 as done and returns the stored request, or `None` if the
    /// id is unknown.
    pub fn mark_step1_completed(&self, id: CorrelationId) -> Option<TransferRequest> {
        let mut context = self.contexts.get_mut(&id)?;
        context.step1_completed = true;
        Some(context.request)
    }

    /// Removes the context. Idempotent.
    pub fn release(&self, id: CorrelationId) -> Option<CrossShardContext> {
        self.contexts.remove(&id).map(|(_, context)| context)
    }

    pub fn get(&self, id: CorrelationId) -> Option<CrossShardContext> {
        self.contexts.get(&id).map(|context| context.clone())
    }

    /// Number of contexts still held.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Ids of contexts created more than `max_age` ago, sorted ascending.
    pub fn older_than(&self, max_age: Duration) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = self
            .contexts
            .iter()
            .filter(|entry| entry.created_at.elapsed() >= max_age)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
