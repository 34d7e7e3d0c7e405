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

//! Identifiers of operations and of their subscribers.

use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::{Debug, Display};

/// Identifies one fetch operation within a downloader. Ids are never reused
/// by the same downloader.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[debug("OperationId({_0})")]
#[display("op-{_0}")]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    #[must_use]
    pub const fn as_u64(&self) -> u64 { self.0 }
}

/// Identifies one subscriber of an operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
#[debug("SubscriberId({_0})")]
#[display("sub-{_0}")]
pub struct SubscriberId(pub(crate) u64);

/// Monotonic source of [`OperationId`]s.
#[derive(Debug, Default)]
pub(crate) struct OperationIds(AtomicU64);

impl OperationIds {
    pub(crate) fn next(&self) -> OperationId { OperationId(self.0.fetch_add(1, Ordering::Relaxed) + 1) }
}
