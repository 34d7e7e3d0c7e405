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
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use jiff::Timestamp;
use snafu::{OptionExt, ResultExt, ensure};
use strum_macros::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DownloaderConfig,
    context::FetchContext,
    decoder::{DecodeContext, Decoder},
    error::{
        BadImageDataSnafu, BadPayloadSnafu, CacheNotModifiedSnafu, FetchError,
        InvalidResponseSnafu, SessionInvalidatedSnafu, TransportError, TransportFailureSnafu,
    },
    event::{EventSink, FetchEvent, FetchPayload},
    id::{OperationId, SubscriberId},
    lifecycle::{Lifecycle, LifecycleKind},
    metrics::{FETCH_ACTIVE, FETCH_BYTES, FETCH_DURATION, FETCH_FINISHED, FETCH_STARTED},
    options::{FetchOptions, Priority},
    pipeline::Pipeline,
    request::{FetchRequest, FetchResponse, RequestKey},
    transport::{Transport, TransportResponse},
};

/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOCATION: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Phase {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub(crate) const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Acceptance rules applied to every response.
#[derive(Debug, Clone)]
pub(crate) struct ResponsePolicy {
    pub(crate) acceptable_status_codes:   Range<u16>,
    pub(crate) acceptable_content_types:  Option<Vec<String>>,
    pub(crate) minimum_progress_interval: f64,
}

impl ResponsePolicy {
    pub(crate) fn from_config(config: &DownloaderConfig) -> Self {
        Self {
            acceptable_status_codes:   config.acceptable_status_codes.clone(),
            acceptable_content_types:  config.acceptable_content_types.clone(),
            minimum_progress_interval: config.minimum_progress_interval,
        }
    }

    pub(crate) fn check(
        &self,
        response: &FetchResponse,
        options: &FetchOptions,
    ) -> Result<(), FetchError> {
        let url = response.url.as_str();
        let status = response.status.as_u16();

        // Nothing is cached on this side, so a 304 never carries a payload.
        ensure!(
            status != 304 && !(response.from_cache && options.ignore_cached_response),
            CacheNotModifiedSnafu { url }
        );
        ensure!(
            self.acceptable_status_codes.contains(&status),
            InvalidResponseSnafu {
                url,
                status: Some(status),
                reason: format!("unacceptable status code {status}"),
            }
        );

        if let (Some(accepted), Some(content_type)) =
            (&self.acceptable_content_types, response.content_type())
        {
            ensure!(
                accepted
                    .iter()
                    .any(|pattern| mime_matches(pattern, &content_type)),
                InvalidResponseSnafu {
                    url,
                    status: Some(status),
                    reason: format!("unacceptable content type {content_type}"),
                }
            );
        }
        Ok(())
    }

    fn should_report(&self, last: u64, received: u64, expected: Option<u64>) -> bool {
        let Some(expected) = expected.filter(|&n| n > 0) else {
            return true;
        };
        if self.minimum_progress_interval <= 0.0 || received >= expected {
            return true;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = (received - last) as f64 / expected as f64;
        fraction >= self.minimum_progress_interval
    }
}

/// `image/*` style wildcards are honoured; comparison ignores case.
fn mime_matches(pattern: &str, content_type: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*/*" {
        return true;
    }
    match pattern.strip_suffix("/*") {
        Some(kind) => content_type
            .split_once('/')
            .is_some_and(|(actual, _)| actual.eq_ignore_ascii_case(kind)),
        None => pattern.eq_ignore_ascii_case(content_type),
    }
}

/// Shared by every operation of one downloader.
pub(crate) struct Environment {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) decoder:   Arc<dyn Decoder>,
    pub(crate) policy:    ResponsePolicy,
}

/// Outcome of detaching one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detach {
    NotFound,
    Detached,
    /// The subscriber was the last one; the operation is now cancelled.
    LastGone,
}

struct Subscriber {
    id:       SubscriberId,
    priority: Priority,
    sink:     EventSink,
}

struct OperationState {
    phase:           Phase,
    subscribers:     Vec<Subscriber>,
    next_subscriber: u64,
    response:        Option<FetchResponse>,
    outcome:         Option<Result<FetchPayload, FetchError>>,
    started_at:      Option<Timestamp>,
    last_reported:   u64,
}

/// Bookkeeping carried out of the lock after a terminal transition.
struct Settled {
    previous:   Phase,
    phase:      Phase,
    label:      &'static str,
    started_at: Option<Timestamp>,
    status:     Option<u16>,
}

/// One effective request, executed at most once and observed by any number
/// of subscribers.
pub(crate) struct FetchOperation {
    id:        OperationId,
    key:       RequestKey,
    request:   FetchRequest,
    options:   FetchOptions,
    pipeline:  Pipeline,
    context:   FetchContext,
    lifecycle: Lifecycle,
    cancel:    CancellationToken,
    state:     Mutex<OperationState>,
}

impl FetchOperation {
    pub(crate) fn new(
        id: OperationId,
        request: FetchRequest,
        options: FetchOptions,
        pipeline: Pipeline,
        context: FetchContext,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            id,
            key: request.key(),
            request,
            options,
            pipeline,
            context,
            lifecycle,
            cancel: CancellationToken::new(),
            state: Mutex::new(OperationState {
                phase:           Phase::Queued,
                subscribers:     Vec::new(),
                next_subscriber: 0,
                response:        None,
                outcome:         None,
                started_at:      None,
                last_reported:   0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, OperationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) const fn id(&self) -> OperationId { self.id }

    pub(crate) const fn key(&self) -> &RequestKey { &self.key }

    pub(crate) const fn request(&self) -> &FetchRequest { &self.request }

    /// Whether a caller with `options`, `pipeline` and `context` may join
    /// this operation and still observe the payload it asked for.
    pub(crate) fn accepts(
        &self,
        options: &FetchOptions,
        pipeline: &Pipeline,
        context: &FetchContext,
    ) -> bool {
        self.options.progressive == options.progressive
            && self.options.ignore_cached_response == options.ignore_cached_response
            && self.options.decode == options.decode
            && self.context.decoded_type == context.decoded_type
            && self.context.extras.is_empty()
            && context.extras.is_empty()
            && self.pipeline.same_payload_stages(pipeline)
    }

    pub(crate) fn response(&self) -> Option<FetchResponse> { self.state().response.clone() }

    pub(crate) fn phase(&self) -> Phase { self.state().phase }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize { self.state().subscribers.len() }

    /// Highest priority among current subscribers.
    pub(crate) fn priority(&self) -> Priority {
        self.state()
            .subscribers
            .iter()
            .map(|s| s.priority)
            .max()
            .unwrap_or(self.options.priority)
    }

    /// Attach a subscriber. After the terminal state the outcome is replayed
    /// to the sink once and the subscriber is not retained.
    pub(crate) fn subscribe(&self, priority: Priority, sink: EventSink) -> SubscriberId {
        let mut state = self.state();
        let id = SubscriberId(state.next_subscriber);
        state.next_subscriber += 1;

        if state.phase.is_terminal() {
            let outcome = state.outcome.clone().unwrap_or(Err(FetchError::Cancelled));
            let _ = sink.send(FetchEvent::Finished(outcome));
        } else {
            state.subscribers.push(Subscriber { id, priority, sink });
        }
        id
    }

    /// Detach one subscriber, delivering `Cancelled` to it. Detaching the
    /// last subscriber cancels the operation.
    pub(crate) fn unsubscribe(&self, subscriber: SubscriberId) -> Detach {
        let mut state = self.state();
        let Some(pos) = state.subscribers.iter().position(|s| s.id == subscriber) else {
            return Detach::NotFound;
        };
        let removed = state.subscribers.remove(pos);
        let _ = removed
            .sink
            .send(FetchEvent::Finished(Err(FetchError::Cancelled)));

        if !state.subscribers.is_empty() {
            debug!(operation = %self.id, %subscriber, "subscriber detached");
            return Detach::Detached;
        }
        let settled = Self::settle_locked(&mut state, Err(FetchError::Cancelled));
        drop(state);
        if let Some(settled) = settled {
            self.after_settle(settled);
        }
        Detach::LastGone
    }

    /// Cancel for every subscriber. Returns false when already terminal.
    pub(crate) fn cancel(&self) -> bool { self.settle(Err(FetchError::Cancelled)) }

    fn settle(&self, outcome: Result<FetchPayload, FetchError>) -> bool {
        let settled = Self::settle_locked(&mut self.state(), outcome);
        settled.map(|settled| self.after_settle(settled)).is_some()
    }

    fn settle_locked(
        state: &mut OperationState,
        outcome: Result<FetchPayload, FetchError>,
    ) -> Option<Settled> {
        if state.phase.is_terminal() {
            return None;
        }
        let previous = state.phase;
        let (phase, label) = match &outcome {
            Ok(_) => (Phase::Completed, "completed"),
            Err(err) if err.is_cancelled() => (Phase::Cancelled, err.kind()),
            Err(err) => (Phase::Failed, err.kind()),
        };
        state.phase = phase;

        let event = FetchEvent::Finished(outcome.clone());
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.sink.send(event.clone());
        }
        state.outcome = Some(outcome);

        Some(Settled {
            previous,
            phase,
            label,
            started_at: state.started_at,
            status: state.response.as_ref().map(|r| r.status.as_u16()),
        })
    }

    fn after_settle(&self, settled: Settled) {
        if settled.phase == Phase::Cancelled {
            self.cancel.cancel();
        }
        FETCH_FINISHED.with_label_values(&[settled.label]).inc();

        if settled.previous == Phase::Executing {
            FETCH_ACTIVE.dec();
            if let Some(started_at) = settled.started_at {
                FETCH_DURATION.observe(Timestamp::now().duration_since(started_at).as_secs_f64());
            }
            let kind = if settled.phase == Phase::Cancelled {
                LifecycleKind::Stop
            } else {
                LifecycleKind::Finish
            };
            self.lifecycle
                .emit(kind, self.id, &self.request.url, settled.status);
        }

        match settled.phase {
            Phase::Failed => warn!(
                operation = %self.id,
                url = %self.request.url,
                outcome = settled.label,
                "fetch failed"
            ),
            phase => info!(
                operation = %self.id,
                url = %self.request.url,
                outcome = settled.label,
                %phase,
                "fetch finished"
            ),
        }
    }

    /// Queued -> Executing. False when the operation was cancelled first.
    fn begin(&self) -> bool {
        {
            let mut state = self.state();
            if state.phase != Phase::Queued {
                return false;
            }
            state.phase = Phase::Executing;
            state.started_at = Some(Timestamp::now());
        }
        FETCH_STARTED.inc();
        FETCH_ACTIVE.inc();
        self.lifecycle
            .emit(LifecycleKind::Start, self.id, &self.request.url, None);
        debug!(operation = %self.id, url = %self.request.url, "fetch started");
        true
    }

    /// Run the transfer to a terminal state unless cancelled first.
    pub(crate) async fn execute(&self, env: &Environment) {
        if !self.begin() {
            return;
        }
        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            outcome = self.transfer(env) => outcome,
        };
        self.settle(outcome);
    }

    async fn transfer(&self, env: &Environment) -> Result<FetchPayload, FetchError> {
        let url = self.request.url.as_str();

        let TransportResponse { response, mut body } = match env.transport.send(&self.request).await
        {
            Ok(sent) => sent,
            Err(TransportError::Invalidated) => return SessionInvalidatedSnafu.fail(),
            Err(source) => return Err(source).context(TransportFailureSnafu { url }),
        };

        let response = self
            .pipeline
            .modify_response(response)
            .context(InvalidResponseSnafu {
                url,
                status: None::<u16>,
                reason: "rejected by the response modifier",
            })?;
        env.policy.check(&response, &self.options)?;

        let status = response.status.as_u16();
        self.state().response = Some(response.clone());
        self.lifecycle
            .emit(LifecycleKind::ResponseReceived, self.id, &self.request.url, Some(status));
        debug!(operation = %self.id, status, expected = ?response.expected_len, "response received");

        let expected = response.expected_len;
        let decode_context = DecodeContext::new(self.options.decode, &self.context);
        let partials = self.options.progressive
            && self.pipeline.decryptor.is_none()
            && !self.options.decode.avoid_decode;

        let capacity = expected
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
            .min(MAX_PREALLOCATION);
        let mut buffer = BytesMut::with_capacity(capacity);

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context(TransportFailureSnafu { url })?;
            if chunk.is_empty() {
                continue;
            }
            buffer.extend_from_slice(&chunk);
            FETCH_BYTES.inc_by(chunk.len() as u64);
            self.report_progress(&env.policy, buffer.len() as u64, expected, false);

            if partials {
                let snapshot = Bytes::copy_from_slice(&buffer);
                if let Ok(decoded) =
                    env.decoder
                        .decode(&snapshot, &response, &decode_context, false)
                {
                    self.broadcast(&FetchEvent::Partial(FetchPayload {
                        data:     snapshot,
                        decoded:  Some(decoded),
                        response: Some(response.clone()),
                    }));
                }
            }
        }
        self.report_progress(&env.policy, buffer.len() as u64, expected, true);

        ensure!(
            !buffer.is_empty(),
            BadImageDataSnafu {
                url,
                reason: "downloaded payload is empty",
            }
        );

        let data = self
            .pipeline
            .decrypt(buffer.freeze(), &response)
            .context(BadPayloadSnafu { url })?;

        let decoded = if self.options.decode.avoid_decode {
            None
        } else {
            let decoded = env
                .decoder
                .decode(&data, &response, &decode_context, true)
                .map_err(|err| FetchError::BadImageData {
                    url:    url.to_owned(),
                    reason: err.to_string(),
                })?;
            Some(decoded)
        };

        Ok(FetchPayload {
            data,
            decoded,
            response: Some(response),
        })
    }

    /// Send a progress event unless throttled. `force` reports any bytes not
    /// yet reported.
    fn report_progress(
        &self,
        policy: &ResponsePolicy,
        received: u64,
        expected: Option<u64>,
        force: bool,
    ) {
        let mut state = self.state();
        if state.phase.is_terminal() || received <= state.last_reported {
            return;
        }
        if !force && !policy.should_report(state.last_reported, received, expected) {
            return;
        }
        state.last_reported = received;
        let event = FetchEvent::Progress { received, expected };
        for subscriber in &state.subscribers {
            let _ = subscriber.sink.send(event.clone());
        }
    }

    fn broadcast(&self, event: &FetchEvent) {
        let state = self.state();
        if state.phase.is_terminal() {
            return;
        }
        for subscriber in &state.subscribers {
            let _ = subscriber.sink.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, StatusCode, header};
    use reqwest::Url;

    use super::*;

    fn policy() -> ResponsePolicy { ResponsePolicy::from_config(&DownloaderConfig::default()) }

    fn response(status: u16) -> FetchResponse {
        FetchResponse::new(
            Url::parse("https://example.com/a.png").unwrap(),
            StatusCode::from_u16(status).unwrap(),
        )
    }

    fn operation() -> FetchOperation {
        FetchOperation::new(
            OperationId(1),
            FetchRequest::get(Url::parse("https://example.com/a.png").unwrap()),
            FetchOptions::default(),
            Pipeline::default(),
            FetchContext::default(),
            Lifecycle::new(4),
        )
    }

    #[test]
    fn status_policy() {
        let options = FetchOptions::default();
        assert!(policy().check(&response(200), &options).is_ok());
        assert!(matches!(
            policy().check(&response(404), &options),
            Err(FetchError::InvalidResponse {
                status: Some(404),
                ..
            })
        ));
        assert!(matches!(
            policy().check(&response(304), &options),
            Err(FetchError::CacheNotModified { .. })
        ));
    }

    #[test]
    fn cached_response_only_rejected_when_ignored() {
        let mut cached = response(200);
        cached.from_cache = true;
        assert!(policy().check(&cached, &FetchOptions::default()).is_ok());

        let options = FetchOptions::builder().ignore_cached_response(true).build();
        assert!(matches!(
            policy().check(&cached, &options),
            Err(FetchError::CacheNotModified { .. })
        ));
    }

    #[test]
    fn content_type_policy_supports_wildcards() {
        let mut policy = policy();
        policy.acceptable_content_types = Some(vec!["image/*".into()]);

        let mut png = response(200);
        png.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
        assert!(policy.check(&png, &FetchOptions::default()).is_ok());

        let mut html = response(200);
        html.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert!(policy.check(&html, &FetchOptions::default()).is_err());

        // No content type at all is not held against the response.
        assert!(policy.check(&response(200), &FetchOptions::default()).is_ok());
    }

    #[test]
    fn progress_throttling() {
        let mut policy = policy();
        assert!(policy.should_report(0, 1, Some(100)));

        policy.minimum_progress_interval = 0.5;
        assert!(!policy.should_report(0, 10, Some(100)));
        assert!(policy.should_report(0, 50, Some(100)));
        assert!(policy.should_report(90, 100, Some(100)));
        assert!(policy.should_report(0, 10, None));
    }

    #[test]
    fn last_subscriber_cancels() {
        let op = operation();
        let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
        let a = op.subscribe(Priority::Low, tx_a);
        let b = op.subscribe(Priority::High, tx_b);
        assert_eq!(op.priority(), Priority::High);

        assert_eq!(op.unsubscribe(b), Detach::Detached);
        assert!(matches!(
            rx_b.try_recv(),
            Ok(FetchEvent::Finished(Err(FetchError::Cancelled)))
        ));
        assert_eq!(op.priority(), Priority::Low);
        assert_eq!(op.phase(), Phase::Queued);

        assert_eq!(op.unsubscribe(a), Detach::LastGone);
        assert_eq!(op.phase(), Phase::Cancelled);
        assert!(matches!(
            rx_a.try_recv(),
            Ok(FetchEvent::Finished(Err(FetchError::Cancelled)))
        ));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(op.unsubscribe(a), Detach::NotFound);
    }

    #[test]
    fn late_subscriber_gets_replay() {
        let op = operation();
        assert!(op.cancel());
        assert!(!op.cancel());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        op.subscribe(Priority::Normal, tx);
        assert!(matches!(
            rx.try_recv(),
            Ok(FetchEvent::Finished(Err(FetchError::Cancelled)))
        ));
        assert_eq!(op.subscriber_count(), 0);
    }

    #[test]
    fn mime_wildcards() {
        assert!(mime_matches("*/*", "text/plain"));
        assert!(mime_matches("IMAGE/*", "image/webp"));
        assert!(mime_matches("image/png", "image/png"));
        assert!(!mime_matches("image/png", "image/jpeg"));
        assert!(!mime_matches("image/*", "video/mp4"));
    }
}
