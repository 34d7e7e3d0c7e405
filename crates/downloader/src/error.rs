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

use std::{path::PathBuf, sync::Arc};

use pixload_error::{ErrorExt, StatusCode};
use snafu::Snafu;

/// Failures raised by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("Request to {url} failed"))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("Reading the body of {url} failed"))]
    Body { url: String, source: reqwest::Error },

    #[snafu(display("Failed to build HTTP client"))]
    ClientBuild { source: reqwest::Error },

    #[snafu(display("Failed to read {}", path.display()))]
    FileRead {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("URL {url} does not name a local file"))]
    NotAFile { url: String },

    #[snafu(display("Unsupported URL scheme: {scheme}"))]
    UnsupportedScheme { scheme: String },

    #[snafu(display("Transport session has been invalidated"))]
    Invalidated,

    /// Escape hatch for third-party transports.
    #[snafu(display("{message}"))]
    Custom { message: String },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Request { source, .. } | Self::Body { source, .. } => source.is_timeout(),
            Self::FileRead { source, .. } => source.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Failure reported by a [`Decoder`](crate::Decoder).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    #[snafu(display("Unsupported payload: {reason}"))]
    Unsupported { reason: String },

    #[snafu(display("Malformed payload: {reason}"))]
    Malformed { reason: String },
}

/// Terminal failure of a fetch.
///
/// One operation may serve several subscribers, so the error is `Clone` and
/// the transport cause is shared behind an `Arc`.
#[derive(Debug, Clone, Snafu, strum_macros::IntoStaticStr)]
#[snafu(visibility(pub))]
#[strum(serialize_all = "snake_case")]
pub enum FetchError {
    #[snafu(display("Invalid request: {reason}"))]
    InvalidRequest { reason: String },

    #[snafu(display("Invalid response from {url}: {reason}"))]
    InvalidResponse {
        url:    String,
        status: Option<u16>,
        reason: String,
    },

    #[snafu(display("Payload from {url} was rejected by the decryptor"))]
    BadPayload { url: String },

    #[snafu(display("Bad image data from {url}: {reason}"))]
    BadImageData { url: String, reason: String },

    #[snafu(display("Fetch cancelled"))]
    Cancelled,

    #[snafu(display("Downloader session has been invalidated"))]
    SessionInvalidated,

    #[snafu(display("Transport failure for {url}"))]
    TransportFailure {
        url:    String,
        #[snafu(source(from(TransportError, Arc::new)))]
        source: Arc<TransportError>,
    },

    #[snafu(display("Invalid fetch options: {reason}"))]
    InvalidOptions { reason: String },

    #[snafu(display("{url} was not modified"))]
    CacheNotModified { url: String },
}

impl FetchError {
    /// Stable snake_case name, used as the metrics outcome label.
    #[must_use]
    pub fn kind(&self) -> &'static str { self.into() }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}

impl ErrorExt for FetchError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::InvalidOptions { .. } => StatusCode::InvalidArgument,
            Self::InvalidResponse {
                status: Some(404 | 410),
                ..
            } => StatusCode::NotFound,
            Self::InvalidResponse { .. }
            | Self::TransportFailure { .. }
            | Self::SessionInvalidated => StatusCode::Unavailable,
            Self::BadPayload { .. } | Self::BadImageData { .. } => StatusCode::DataLoss,
            Self::Cancelled => StatusCode::Cancelled,
            Self::CacheNotModified { .. } => StatusCode::NotModified,
        }
    }
}
