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
    fmt,
    sync::{
        Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use reqwest::Url;

use crate::{
    downloader::DownloaderInner,
    id::{OperationId, SubscriberId},
    operation::{Detach, FetchOperation},
    request::{FetchRequest, FetchResponse},
};

/// Handle to one subscription of a fetch.
///
/// Coalesced fetches share an operation but each gets its own token, so
/// callers cancel independently. The token never keeps the operation alive.
pub struct DownloadToken {
    operation:    Weak<FetchOperation>,
    downloader:   Weak<DownloaderInner>,
    operation_id: OperationId,
    subscriber:   SubscriberId,
    url:          Url,
    cancelled:    AtomicBool,
}

impl DownloadToken {
    pub(crate) fn new(
        operation: Weak<FetchOperation>,
        downloader: Weak<DownloaderInner>,
        operation_id: OperationId,
        subscriber: SubscriberId,
        url: Url,
    ) -> Self {
        Self {
            operation,
            downloader,
            operation_id,
            subscriber,
            url,
            cancelled: AtomicBool::new(false),
        }
    }

    pub const fn url(&self) -> &Url { &self.url }

    pub const fn operation_id(&self) -> OperationId { self.operation_id }

    pub const fn subscriber_id(&self) -> SubscriberId { self.subscriber }

    /// The effective request, while the operation is still tracked.
    pub fn request(&self) -> Option<FetchRequest> {
        self.operation.upgrade().map(|op| op.request().clone())
    }

    /// Response metadata once headers have arrived.
    pub fn response(&self) -> Option<FetchResponse> {
        self.operation.upgrade().and_then(|op| op.response())
    }

    pub fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }

    /// Unsubscribe. This subscriber receives `Cancelled`; if it was the last
    /// one the operation is cancelled as well. No-op once the fetch is
    /// finished or the token was already cancelled.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(operation) = self.operation.upgrade() else {
            return;
        };
        let detach = operation.unsubscribe(self.subscriber);
        let Some(downloader) = self.downloader.upgrade() else {
            return;
        };
        match detach {
            Detach::LastGone => downloader.retire(self.operation_id),
            Detach::Detached => downloader.detached(self.operation_id),
            Detach::NotFound => {}
        }
    }
}

impl fmt::Debug for DownloadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadToken")
            .field("operation", &self.operation_id)
            .field("subscriber", &self.subscriber)
            .field("url", &self.url.as_str())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
