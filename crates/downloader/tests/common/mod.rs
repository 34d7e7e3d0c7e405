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

//! Scripted transport and helpers shared by the engine tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderName, HeaderValue, StatusCode, header};
use pixload_downloader::{
    Downloader, DownloaderConfig, FetchRequest, FetchResponse, Transport, TransportError,
    TransportResponse, Url,
};
use tokio::{runtime::Handle, sync::Semaphore};

pub const BASE: &str = "https://mock.test";

pub fn url(path: &str) -> String { format!("{BASE}/{path}") }

/// Holds every send routed through it until opened.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn new() -> Self { Self(Arc::new(Semaphore::new(0))) }

    pub fn open(&self) { self.0.add_permits(Semaphore::MAX_PERMITS / 2); }

    async fn pass(&self) {
        let _permit = self.0.acquire().await.expect("gate semaphore closed");
    }
}

#[derive(Clone)]
pub struct Route {
    status:       u16,
    headers:      Vec<(HeaderName, HeaderValue)>,
    chunks:       Vec<Bytes>,
    expected_len: Option<u64>,
    gate:         Option<Gate>,
    chunk_delay:  Option<Duration>,
}

impl Route {
    pub fn ok(chunks: &[&[u8]]) -> Self {
        let chunks: Vec<Bytes> = chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect();
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            status: 200,
            headers: Vec::new(),
            chunks,
            expected_len: Some(len),
            gate: None,
            chunk_delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            expected_len: None,
            ..Self::ok(&[b"body"])
        }
    }

    pub fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    pub fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .push((HeaderName::from_static(name), HeaderValue::from_static(value)));
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

/// Decrements the active counter when the transfer ends or is dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

#[derive(Default)]
pub struct MockTransport {
    routes:      Mutex<HashMap<String, Route>>,
    requests:    Mutex<Vec<FetchRequest>>,
    active:      Arc<AtomicUsize>,
    max_active:  AtomicUsize,
    invalidated: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(url(path), route);
    }

    pub fn calls(&self) -> usize { self.requests.lock().unwrap().len() }

    pub fn calls_for(&self, path: &str) -> usize {
        let target = url(path);
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.as_str() == target)
            .count()
    }

    /// Request paths in the order they reached the transport.
    pub fn order(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.path().trim_start_matches('/').to_string())
            .collect()
    }

    pub fn last_request(&self) -> Option<FetchRequest> { self.requests.lock().unwrap().last().cloned() }

    pub fn active(&self) -> usize { self.active.load(Ordering::SeqCst) }

    pub fn max_active(&self) -> usize { self.max_active.load(Ordering::SeqCst) }

    pub fn is_invalidated(&self) -> bool { self.invalidated.load(Ordering::SeqCst) }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        if self.invalidated.load(Ordering::SeqCst) {
            return Err(TransportError::Invalidated);
        }
        self.requests.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        let Some(route) = route else {
            return Err(TransportError::Custom {
                message: format!("connection refused: {}", request.url),
            });
        };
        if let Some(gate) = &route.gate {
            gate.pass().await;
        }

        let mut response = FetchResponse::new(
            request.url.clone(),
            StatusCode::from_u16(route.status).unwrap(),
        );
        response.expected_len = route.expected_len;
        if let Some(len) = route.expected_len {
            response
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        for (name, value) in route.headers {
            response.headers.insert(name, value);
        }

        let delay = route.chunk_delay;
        let body = futures::stream::iter(route.chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, TransportError>(chunk)
            })
            .map(move |chunk| {
                let _active = &guard;
                chunk
            })
            .boxed();

        Ok(TransportResponse { response, body })
    }

    fn supports(&self, url: &Url) -> bool { url.scheme() == "https" }

    fn invalidate(&self) { self.invalidated.store(true, Ordering::SeqCst); }
}

/// A downloader over `transport` whose operations and callbacks run on the
/// test's runtime.
pub fn engine(transport: &Arc<MockTransport>, config: DownloaderConfig) -> Downloader {
    let config = DownloaderConfig {
        runtime: Some(Handle::current()),
        callback_runtime: Some(Handle::current()),
        ..config
    };
    Downloader::with_transport(config, Arc::clone(transport) as Arc<dyn Transport>)
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
