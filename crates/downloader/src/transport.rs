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
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use http::{HeaderValue, StatusCode, header};
use reqwest::Url;
use snafu::{OptionExt, ResultExt, ensure};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    error::{
        BodySnafu, ClientBuildSnafu, FileReadSnafu, InvalidatedSnafu, NotAFileSnafu, RequestSnafu,
        TransportError, UnsupportedSchemeSnafu,
    },
    options::CachePolicy,
    request::{FetchRequest, FetchResponse},
};

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response headers plus the body as a stream of chunks.
pub struct TransportResponse {
    pub response: FetchResponse,
    pub body:     BodyStream,
}

impl TransportResponse {
    /// A response whose body is already in memory, yielded as the given
    /// chunks.
    pub fn from_chunks(response: FetchResponse, chunks: Vec<Bytes>) -> Self {
        Self {
            response,
            body: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }
}

/// The session every operation of a downloader sends through.
///
/// Dropping the future returned by `send`, or the body stream, aborts the
/// transfer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError>;

    /// Whether this transport knows how to load `url` at all.
    fn supports(&self, url: &Url) -> bool;

    /// Tear the session down. Later sends fail with
    /// [`TransportError::Invalidated`]; transfers already running finish.
    fn invalidate(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientFlavor {
    cookies:  bool,
    insecure: bool,
}

/// HTTP(S) transport on top of `reqwest`.
///
/// Clients are built lazily, one per combination of cookie handling and TLS
/// strictness, and share their connection pools across operations.
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    clients:     Mutex<HashMap<ClientFlavor, reqwest::Client>>,
    invalidated: AtomicBool,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn client(&self, flavor: ClientFlavor) -> Result<reqwest::Client, TransportError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        ensure!(!self.invalidated.load(Ordering::Acquire), InvalidatedSnafu);

        if let Some(client) = clients.get(&flavor) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .cookie_store(flavor.cookies)
            .danger_accept_invalid_certs(flavor.insecure)
            .build()
            .context(ClientBuildSnafu)?;
        debug!(?flavor, "built http client");
        clients.insert(flavor, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client(ClientFlavor {
            cookies:  request.handle_cookies,
            insecure: request.allow_invalid_tls,
        })?;

        let mut headers = request.headers.clone();
        // No local cache here; reloading asks intermediaries to revalidate.
        if request.cache_policy == CachePolicy::ReloadIgnoringLocalCache {
            headers
                .entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
        }
        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if let Some(timeout) = request.timeout.and_then(|t| Duration::try_from(t).ok()) {
            builder = builder.timeout(timeout);
        }

        let url = request.url.to_string();
        let response = builder.send().await.context(RequestSnafu { url: &url })?;

        let meta = FetchResponse {
            url:          response.url().clone(),
            status:       response.status(),
            headers:      response.headers().clone(),
            expected_len: response.content_length(),
            from_cache:   false,
        };
        let body = response
            .bytes_stream()
            .map_err(move |source| TransportError::Body {
                url: url.clone(),
                source,
            })
            .boxed();

        Ok(TransportResponse {
            response: meta,
            body,
        })
    }

    fn supports(&self, url: &Url) -> bool { matches!(url.scheme(), "http" | "https") }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Loads `file://` URLs from the local filesystem.
#[derive(Debug, Default)]
pub struct FileTransport {
    invalidated: AtomicBool,
}

impl FileTransport {
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        ensure!(!self.invalidated.load(Ordering::Acquire), InvalidatedSnafu);

        let path = request
            .url
            .to_file_path()
            .ok()
            .context(NotAFileSnafu { url: request.url.as_str() })?;
        let file = tokio::fs::File::open(&path)
            .await
            .context(FileReadSnafu { path: &path })?;
        let metadata = file
            .metadata()
            .await
            .context(FileReadSnafu { path: &path })?;
        ensure!(metadata.is_file(), NotAFileSnafu { url: request.url.as_str() });
        let len = metadata.len();

        let mut response = FetchResponse::new(request.url.clone(), StatusCode::OK);
        response.expected_len = Some(len);
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(len));

        let body = ReaderStream::new(file)
            .map_err(move |source| TransportError::FileRead {
                path: path.clone(),
                source,
            })
            .boxed();

        Ok(TransportResponse { response, body })
    }

    fn supports(&self, url: &Url) -> bool { url.scheme() == "file" }

    fn invalidate(&self) { self.invalidated.store(true, Ordering::Release); }
}

/// Default transport: routes `http`/`https` to [`ReqwestTransport`] and
/// `file` to [`FileTransport`].
#[derive(Debug, Default)]
pub struct SessionTransport {
    http: ReqwestTransport,
    file: FileTransport,
}

impl SessionTransport {
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        if self.file.supports(&request.url) {
            self.file.send(request).await
        } else if self.http.supports(&request.url) {
            self.http.send(request).await
        } else {
            UnsupportedSchemeSnafu {
                scheme: request.url.scheme(),
            }
            .fail()
        }
    }

    fn supports(&self, url: &Url) -> bool { self.http.supports(url) || self.file.supports(url) }

    fn invalidate(&self) {
        self.http.invalidate();
        self.file.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn request(url: &str) -> FetchRequest { FetchRequest::get(Url::parse(url).unwrap()) }

    #[test]
    fn session_routes_by_scheme() {
        let transport = SessionTransport::new();
        assert!(transport.supports(&Url::parse("https://example.com/a").unwrap()));
        assert!(transport.supports(&Url::parse("http://example.com/a").unwrap()));
        assert!(transport.supports(&Url::parse("file:///tmp/a").unwrap()));
        assert!(!transport.supports(&Url::parse("ftp://example.com/a").unwrap()));
    }

    #[tokio::test]
    async fn unsupported_scheme_fails() {
        let transport = SessionTransport::new();
        let err = transport
            .send(&request("ftp://example.com/a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::UnsupportedScheme { scheme } if scheme == "ftp"));
    }

    #[tokio::test]
    async fn file_transport_streams_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"pixels").unwrap();
        let url = Url::from_file_path(file.path()).unwrap();

        let transport = FileTransport::new();
        let TransportResponse { response, body } =
            transport.send(&FetchRequest::get(url)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.expected_len, Some(6));

        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"pixels");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent.png")).unwrap();
        let err = FileTransport::new()
            .send(&FetchRequest::get(url))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::FileRead { .. }));
    }

    #[tokio::test]
    async fn directories_are_not_files() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(dir.path()).unwrap();
        let err = FileTransport::new()
            .send(&FetchRequest::get(url))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::NotAFile { .. }));
    }

    #[tokio::test]
    async fn invalidated_session_rejects_sends() {
        let transport = SessionTransport::new();
        transport.invalidate();
        let err = transport
            .send(&request("http://127.0.0.1:9/a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Invalidated));
    }
}
