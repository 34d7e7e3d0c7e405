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
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{decoder::Decoded, error::FetchError, request::FetchResponse, token::DownloadToken};

/// Bytes of a fetch together with their decoded form.
#[derive(Clone)]
pub struct FetchPayload {
    pub data:     Bytes,
    /// `None` when decoding was skipped.
    pub decoded:  Option<Decoded>,
    pub response: Option<FetchResponse>,
}

impl fmt::Debug for FetchPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPayload")
            .field("len", &self.data.len())
            .field("decoded", &self.decoded.is_some())
            .field("response", &self.response.as_ref().map(|r| r.status))
            .finish()
    }
}

/// Everything a subscriber can observe about a fetch, in delivery order:
/// any number of `Progress` and `Partial` events, then exactly one
/// `Finished`.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    Progress {
        received: u64,
        expected: Option<u64>,
    },
    Partial(FetchPayload),
    Finished(Result<FetchPayload, FetchError>),
}

impl FetchEvent {
    #[must_use]
    pub const fn is_final(&self) -> bool { matches!(self, Self::Finished(_)) }
}

/// Called with `(received, expected)` for every progress report.
pub type ProgressCallback = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Called with `Partial` and `Finished` events.
pub type CompletionCallback = Box<dyn FnMut(FetchEvent) + Send>;

pub(crate) type EventSink = mpsc::UnboundedSender<FetchEvent>;

/// Create a sink whose events are handed to the callbacks, in order, by a
/// task on `runtime`.
pub(crate) fn callback_sink(
    runtime: &Handle,
    mut on_progress: Option<ProgressCallback>,
    mut on_complete: Option<CompletionCallback>,
) -> EventSink {
    let (tx, mut rx) = mpsc::unbounded_channel::<FetchEvent>();
    runtime.spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Progress { received, expected } => {
                    if let Some(callback) = on_progress.as_mut() {
                        callback(received, expected);
                    }
                }
                event => {
                    let last = event.is_final();
                    if let Some(callback) = on_complete.as_mut() {
                        callback(event);
                    }
                    if last {
                        break;
                    }
                }
            }
        }
    });
    tx
}

/// Stream of [`FetchEvent`]s for one fetch. Ends after the `Finished`
/// event.
///
/// Dropping the stream before it finishes cancels the fetch for this
/// subscriber.
pub struct FetchEvents {
    events:   UnboundedReceiverStream<FetchEvent>,
    token:    Option<DownloadToken>,
    finished: bool,
}

impl FetchEvents {
    pub(crate) fn channel() -> (EventSink, mpsc::UnboundedReceiver<FetchEvent>) {
        mpsc::unbounded_channel()
    }

    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<FetchEvent>,
        token: Option<DownloadToken>,
    ) -> Self {
        Self {
            events: UnboundedReceiverStream::new(receiver),
            token,
            finished: false,
        }
    }

    /// The token backing this stream, `None` when the fetch was rejected
    /// before it started.
    pub const fn token(&self) -> Option<&DownloadToken> { self.token.as_ref() }

    /// Drive the stream to the end and return the outcome.
    pub async fn finished(mut self) -> Result<FetchPayload, FetchError> {
        while let Some(event) = self.next().await {
            if let FetchEvent::Finished(result) = event {
                return result;
            }
        }
        Err(FetchError::Cancelled)
    }
}

impl fmt::Debug for FetchEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEvents")
            .field("token", &self.token)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for FetchEvents {
    type Item = FetchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = Pin::new(&mut self.events).poll_next(cx);
        match &polled {
            Poll::Ready(Some(event)) if event.is_final() => self.finished = true,
            Poll::Ready(None) => self.finished = true,
            _ => {}
        }
        polled
    }
}

impl Drop for FetchEvents {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(token) = &self.token {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn only_finished_is_final() {
        assert!(!FetchEvent::Progress {
            received: 1,
            expected: None,
        }
        .is_final());
        assert!(FetchEvent::Finished(Err(FetchError::Cancelled)).is_final());
    }

    #[tokio::test]
    async fn callbacks_see_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress_seen = Arc::clone(&seen);
        let complete_seen = Arc::clone(&seen);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut done_tx = Some(done_tx);

        let sink = callback_sink(
            &Handle::current(),
            Some(Box::new(move |received: u64, _: Option<u64>| {
                progress_seen.lock().unwrap().push(format!("progress {received}"));
            })),
            Some(Box::new(move |event: FetchEvent| {
                complete_seen.lock().unwrap().push(format!("final {}", event.is_final()));
                if event.is_final() {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send(());
                    }
                }
            })),
        );

        for received in [10, 20] {
            sink.send(FetchEvent::Progress {
                received,
                expected: Some(20),
            })
            .unwrap();
        }
        sink.send(FetchEvent::Finished(Err(FetchError::Cancelled)))
            .unwrap();
        done_rx.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["progress 10", "progress 20", "final true"]
        );
    }

    #[tokio::test]
    async fn stream_stops_after_finished() {
        let (tx, rx) = FetchEvents::channel();
        tx.send(FetchEvent::Progress {
            received: 1,
            expected: None,
        })
        .unwrap();
        tx.send(FetchEvent::Finished(Err(FetchError::SessionInvalidated)))
            .unwrap();
        tx.send(FetchEvent::Progress {
            received: 2,
            expected: None,
        })
        .unwrap();

        let events: Vec<FetchEvent> = FetchEvents::new(rx, None).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_final());
    }
}
