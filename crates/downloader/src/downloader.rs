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
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use http::{HeaderMap, HeaderName, HeaderValue, header};
use once_cell::sync::OnceCell;
use pixload_common_runtime::{Handle, delivery_runtime, transfer_runtime};
use reqwest::Url;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    config::{Credentials, DownloaderConfig},
    context::FetchContext,
    decoder::{Decoder, PassthroughDecoder},
    error::FetchError,
    event::{
        CompletionCallback, EventSink, FetchEvent, FetchEvents, FetchPayload, ProgressCallback,
        callback_sink,
    },
    id::{OperationId, OperationIds, SubscriberId},
    lifecycle::{Lifecycle, LifecycleEvent},
    metrics::FETCH_COALESCED,
    operation::{Environment, FetchOperation, Phase, ResponsePolicy},
    options::FetchOptions,
    pipeline::{Decryptor, Pipeline, RequestModifier, ResponseModifier},
    queue::{Admitted, OperationQueue},
    request::{FetchRequest, RequestKey},
    token::DownloadToken,
    transport::{SessionTransport, Transport},
};

static SHARED: OnceCell<Downloader> = OnceCell::new();

/// Entry point of the fetch engine.
///
/// Fetches are queued by priority and run on a bounded number of
/// concurrent operations. Each fetch returns a [`DownloadToken`] at once;
/// results arrive through callbacks or a [`FetchEvents`] stream.
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

/// Mutable engine settings and the operation registry, behind one lock.
struct EngineState {
    headers:     HeaderMap,
    pipeline:    Pipeline,
    queue:       OperationQueue<Arc<FetchOperation>>,
    operations:  HashMap<OperationId, Arc<FetchOperation>>,
    coalescing:  HashMap<RequestKey, OperationId>,
    invalidated: bool,
}

pub(crate) struct DownloaderInner {
    config:           DownloaderConfig,
    env:              Environment,
    lifecycle:        Lifecycle,
    runtime:          Handle,
    callback_runtime: Handle,
    ids:              OperationIds,
    shared:           bool,
    state:            Mutex<EngineState>,
}

impl Downloader {
    /// Create a downloader that loads `http`, `https` and `file` URLs.
    #[must_use]
    pub fn new(config: DownloaderConfig) -> Self {
        Self::with_transport(config, Arc::new(SessionTransport::new()))
    }

    #[must_use]
    pub fn with_transport(config: DownloaderConfig, transport: Arc<dyn Transport>) -> Self {
        Self::from_parts(config, transport, Arc::new(PassthroughDecoder))
    }

    #[must_use]
    pub fn from_parts(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self::build(config, transport, decoder, false)
    }

    /// Process-wide instance with the default configuration. It is created
    /// on first use and ignores [`invalidate_session`](Self::invalidate_session).
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| {
            Self::build(
                DownloaderConfig::default(),
                Arc::new(SessionTransport::new()),
                Arc::new(PassthroughDecoder),
                true,
            )
        })
    }

    fn build(
        config: DownloaderConfig,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
        shared: bool,
    ) -> Self {
        let runtime = config
            .runtime
            .clone()
            .unwrap_or_else(|| transfer_runtime().handle().clone());
        let callback_runtime = config
            .callback_runtime
            .clone()
            .unwrap_or_else(|| delivery_runtime().handle().clone());

        let state = EngineState {
            headers:     default_headers(&config),
            pipeline:    Pipeline::default(),
            queue:       OperationQueue::new(config.execution_order, config.max_concurrent_downloads),
            operations:  HashMap::new(),
            coalescing:  HashMap::new(),
            invalidated: false,
        };
        let inner = DownloaderInner {
            env: Environment {
                transport,
                decoder,
                policy: ResponsePolicy::from_config(&config),
            },
            lifecycle: Lifecycle::new(config.lifecycle_capacity),
            runtime,
            callback_runtime,
            ids: OperationIds::default(),
            shared,
            state: Mutex::new(state),
            config,
        };
        debug!(
            max_concurrent = inner.config.max_concurrent_downloads,
            order = %inner.config.execution_order,
            coalesce = inner.config.coalesce_requests,
            shared,
            "downloader created"
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &DownloaderConfig { &self.inner.config }

    /// Start fetching `url`.
    ///
    /// Returns `None` without invoking any callback when `url` is absent or
    /// blank. Returns `None` after delivering a `Finished` error to
    /// `on_complete` when the URL does not parse, the options contradict
    /// each other, the session was invalidated or the request modifier
    /// rejected the request. Otherwise the fetch is queued and its token
    /// returned.
    ///
    /// `on_progress` receives `(received, expected)` reports; `on_complete`
    /// receives `Partial` events of progressive fetches and the final
    /// `Finished` event. Both run on the callback runtime, in order.
    pub fn fetch(
        &self,
        url: Option<&str>,
        options: FetchOptions,
        context: FetchContext,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompletionCallback>,
    ) -> Option<DownloadToken> {
        let url = url.map(str::trim).filter(|url| !url.is_empty())?;
        let runtime = context
            .callback_runtime
            .clone()
            .unwrap_or_else(|| self.inner.callback_runtime.clone());
        let sink = callback_sink(&runtime, on_progress, on_complete);
        self.inner.submit(url, options, context, sink)
    }

    /// Like [`fetch`](Self::fetch), delivering events as a stream. A
    /// rejected fetch yields a single `Finished` error.
    pub fn fetch_events(&self, url: &str, options: FetchOptions, context: FetchContext) -> FetchEvents {
        let (sink, receiver) = FetchEvents::channel();
        let token = self.inner.submit(url.trim(), options, context, sink);
        FetchEvents::new(receiver, token)
    }

    /// Fetch with default options and wait for the outcome.
    pub async fn fetch_url(&self, url: &str) -> Result<FetchPayload, FetchError> {
        self.fetch_events(url, FetchOptions::default(), FetchContext::default())
            .finished()
            .await
    }

    /// Set a default header for later fetches; `None` removes it.
    pub fn set_header(&self, field: &str, value: Option<&str>) -> Result<(), FetchError> {
        let name = HeaderName::from_bytes(field.as_bytes()).map_err(|e| {
            FetchError::InvalidRequest {
                reason: format!("invalid header name {field:?}: {e}"),
            }
        })?;
        let mut state = self.inner.state();
        match value {
            Some(value) => {
                let value =
                    HeaderValue::from_str(value).map_err(|e| FetchError::InvalidRequest {
                        reason: format!("invalid value for header {field}: {e}"),
                    })?;
                state.headers.insert(name, value);
            }
            None => {
                state.headers.remove(name);
            }
        }
        Ok(())
    }

    pub fn header(&self, field: &str) -> Option<String> {
        self.inner
            .state()
            .headers
            .get(field)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    pub fn set_request_modifier(&self, modifier: Option<RequestModifier>) {
        self.inner.state().pipeline.request_modifier = modifier;
    }

    pub fn set_response_modifier(&self, modifier: Option<ResponseModifier>) {
        self.inner.state().pipeline.response_modifier = modifier;
    }

    pub fn set_decryptor(&self, decryptor: Option<Decryptor>) {
        self.inner.state().pipeline.decryptor = decryptor;
    }

    /// Change the concurrency bound. Raising it admits queued operations
    /// immediately; lowering it never interrupts running ones.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        let admitted = self.inner.state().queue.set_max_concurrent(max);
        self.inner.launch(admitted);
    }

    pub fn max_concurrent_downloads(&self) -> usize { self.inner.state().queue.max_concurrent() }

    /// Operations queued or executing.
    pub fn current_download_count(&self) -> usize { self.inner.state().queue.current_count() }

    /// Stop admitting queued operations. Running ones continue.
    pub fn suspend(&self) {
        self.inner.state().queue.suspend();
        debug!("downloader suspended");
    }

    pub fn resume(&self) {
        let admitted = self.inner.state().queue.resume();
        debug!(admitted = admitted.len(), "downloader resumed");
        self.inner.launch(admitted);
    }

    pub fn is_suspended(&self) -> bool { self.inner.state().queue.is_suspended() }

    /// Cancel every tracked operation. All of their subscribers receive
    /// `Cancelled` before this returns, and nothing after it.
    pub fn cancel_all(&self) {
        let mut state = self.inner.state();
        state.queue.drain();
        state.coalescing.clear();
        let operations: Vec<_> = state.operations.drain().map(|(_, op)| op).collect();
        for operation in &operations {
            operation.cancel();
        }
        drop(state);
        info!(cancelled = operations.len(), "cancelled all fetches");
    }

    /// Tear down the transport session. With `cancel_pending`, everything
    /// tracked is cancelled first. Later fetches fail with
    /// `SessionInvalidated`. Does nothing on the shared instance.
    pub fn invalidate_session(&self, cancel_pending: bool) {
        if self.inner.shared {
            debug!("ignoring invalidate_session on the shared downloader");
            return;
        }
        if cancel_pending {
            self.cancel_all();
        }
        self.inner.state().invalidated = true;
        self.inner.env.transport.invalidate();
        info!(cancel_pending, "downloader session invalidated");
    }

    pub fn is_invalidated(&self) -> bool { self.inner.state().invalidated }

    /// Whether the transport can load `url`; `http`, `https` and `file` with
    /// the default transport.
    pub fn can_request(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|url| self.inner.env.transport.supports(&url))
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle.subscribe()
    }
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Downloader")
            .field("shared", &self.inner.shared)
            .field("running", &state.queue.running_count())
            .field("queued", &state.queue.queued_count())
            .field("suspended", &state.queue.is_suspended())
            .field("invalidated", &state.invalidated)
            .finish_non_exhaustive()
    }
}

fn reject(sink: &EventSink, url: &str, err: FetchError) -> Option<DownloadToken> {
    debug!(url, error = %err, "fetch rejected");
    let _ = sink.send(FetchEvent::Finished(Err(err)));
    None
}

fn default_headers(config: &DownloaderConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        (header::ACCEPT, &config.accept),
        (header::USER_AGENT, &config.user_agent),
    ] {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => warn!(header = %name, error = %e, "skipping invalid default header"),
        }
    }
    headers
}

fn basic_auth(credentials: &Credentials) -> Option<HeaderValue> {
    let plain = format!(
        "{}:{}",
        credentials.username,
        credentials.password.as_deref().unwrap_or_default()
    );
    let mut value = HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(plain))).ok()?;
    value.set_sensitive(true);
    Some(value)
}

impl DownloaderInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_request(&self, url: Url, options: &FetchOptions, headers: HeaderMap) -> FetchRequest {
        let mut request = FetchRequest::get(url);
        request.headers = headers;
        if let Some(credentials) = &self.config.credentials {
            if !request.headers.contains_key(header::AUTHORIZATION) {
                if let Some(value) = basic_auth(credentials) {
                    request.headers.insert(header::AUTHORIZATION, value);
                }
            }
        }
        request.timeout = Some(self.config.timeout);
        request.cache_policy = options.cache_policy();
        request.handle_cookies = options.handle_cookies;
        request.allow_invalid_tls = options.allow_invalid_tls;
        request.background = options.continue_in_background;
        request
    }

    fn submit(
        self: &Arc<Self>,
        raw_url: &str,
        options: FetchOptions,
        context: FetchContext,
        sink: EventSink,
    ) -> Option<DownloadToken> {
        let url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(e) => {
                let reason = format!("invalid URL {raw_url:?}: {e}");
                return reject(&sink, raw_url, FetchError::InvalidRequest { reason });
            }
        };
        if let Err(err) = options.validate() {
            return reject(&sink, raw_url, err);
        }
        if options.progressive && context.decryptor.is_some() {
            let reason = "progressive delivery cannot be combined with a decryptor".to_string();
            return reject(&sink, raw_url, FetchError::InvalidOptions { reason });
        }

        let (headers, pipeline) = {
            let state = self.state();
            if state.invalidated {
                drop(state);
                return reject(&sink, raw_url, FetchError::SessionInvalidated);
            }
            (state.headers.clone(), state.pipeline.resolve(&context))
        };

        // User code runs outside the engine lock.
        let request = self.build_request(url, &options, headers);
        let Some(request) = pipeline.modify_request(request) else {
            let reason = "request modifier returned no request".to_string();
            return reject(&sink, raw_url, FetchError::InvalidRequest { reason });
        };

        let priority = options.priority;
        let coalesce = self.config.coalesce_requests && options.allow_coalescing;
        let key = request.key();

        let mut state = self.state();
        if state.invalidated {
            drop(state);
            return reject(&sink, raw_url, FetchError::SessionInvalidated);
        }

        if coalesce {
            let existing = state
                .coalescing
                .get(&key)
                .and_then(|id| state.operations.get(id))
                .filter(|op| op.phase() != Phase::Cancelled)
                .filter(|op| op.accepts(&options, &pipeline, &context))
                .cloned();
            if let Some(operation) = existing {
                let subscriber = operation.subscribe(priority, sink);
                state
                    .queue
                    .reprioritize(operation.id(), operation.priority());
                drop(state);
                FETCH_COALESCED.inc();
                debug!(operation = %operation.id(), %subscriber, url = %request.url, "fetch coalesced");
                return Some(self.token(&operation, subscriber));
            }
        }

        let id = self.ids.next();
        let operation = Arc::new(FetchOperation::new(
            id,
            request,
            options,
            pipeline,
            context,
            self.lifecycle.clone(),
        ));
        let subscriber = operation.subscribe(priority, sink);
        state.operations.insert(id, Arc::clone(&operation));
        if coalesce {
            state.coalescing.insert(key, id);
        }
        let admitted = state.queue.enqueue(id, priority, Arc::clone(&operation));
        drop(state);

        debug!(operation = %id, url = %operation.request().url, %priority, "fetch queued");
        self.launch(admitted);
        Some(self.token(&operation, subscriber))
    }

    fn token(
        self: &Arc<Self>,
        operation: &Arc<FetchOperation>,
        subscriber: SubscriberId,
    ) -> DownloadToken {
        DownloadToken::new(
            Arc::downgrade(operation),
            Arc::downgrade(self),
            operation.id(),
            subscriber,
            operation.request().url.clone(),
        )
    }

    fn launch(self: &Arc<Self>, admitted: Admitted<Arc<FetchOperation>>) {
        for (id, operation) in admitted {
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                operation.execute(&inner.env).await;
                inner.retire(id);
            });
        }
    }

    /// A subscriber left a still-live operation; requeue it at the highest
    /// priority among those that remain.
    pub(crate) fn detached(&self, id: OperationId) {
        let mut state = self.state();
        if let Some(operation) = state.operations.get(&id).cloned() {
            state.queue.reprioritize(id, operation.priority());
        }
    }

    /// Drop a terminal operation from the registry and hand its slot to the
    /// next queued one. Safe to call more than once.
    pub(crate) fn retire(self: &Arc<Self>, id: OperationId) {
        let admitted = {
            let mut state = self.state();
            if let Some(operation) = state.operations.remove(&id) {
                if state.coalescing.get(operation.key()) == Some(&id) {
                    state.coalescing.remove(operation.key());
                }
            }
            state.queue.finish(id)
        };
        self.launch(admitted);
    }
}
