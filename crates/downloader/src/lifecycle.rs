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

use jiff::Timestamp;
use reqwest::Url;
use strum_macros::Display;
use tokio::sync::broadcast;

use crate::id::OperationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleKind {
    /// The operation was admitted and is about to send its request.
    Start,
    ResponseReceived,
    /// The operation was cancelled.
    Stop,
    /// The operation completed or failed.
    Finish,
}

/// Notification broadcast to every [`Downloader::subscribe_lifecycle`]
/// receiver.
///
/// [`Downloader::subscribe_lifecycle`]: crate::Downloader::subscribe_lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub kind:      LifecycleKind,
    pub operation: OperationId,
    pub url:       Url,
    pub status:    Option<u16>,
    pub at:        Timestamp,
}

/// Sending half of the lifecycle channel. Events without receivers are
/// dropped.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Lifecycle {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> { self.sender.subscribe() }

    pub(crate) fn emit(
        &self,
        kind: LifecycleKind,
        operation: OperationId,
        url: &Url,
        status: Option<u16>,
    ) {
        let _ = self.sender.send(LifecycleEvent {
            kind,
            operation,
            url: url.clone(),
            status,
            at: Timestamp::now(),
        });
    }
}
