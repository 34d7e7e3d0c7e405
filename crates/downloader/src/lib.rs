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

//! Asynchronous fetch engine for image payloads.
//!
//! A [`Downloader`] accepts fetches, schedules them by [`Priority`] against a
//! bounded number of concurrent operations, runs each response through the
//! transform [`Pipeline`] and hands the bytes to a [`Decoder`]. Every fetch
//! returns a [`DownloadToken`] immediately; events arrive through callbacks
//! or a [`FetchEvents`] stream.

mod config;
mod context;
mod decoder;
mod downloader;
mod error;
mod event;
mod id;
mod lifecycle;
pub mod metrics;
mod operation;
mod options;
mod pipeline;
mod queue;
mod request;
mod token;
mod transport;

pub use config::{Credentials, DEFAULT_ACCEPT, DownloaderConfig};
pub use context::{ContextValue, FetchContext};
pub use decoder::{DecodeContext, Decoded, Decoder, PassthroughDecoder};
pub use downloader::Downloader;
pub use error::{DecodeError, FetchError, TransportError};
pub use event::{CompletionCallback, FetchEvent, FetchEvents, FetchPayload, ProgressCallback};
pub use id::{OperationId, SubscriberId};
pub use lifecycle::{LifecycleEvent, LifecycleKind};
pub use options::{CachePolicy, DecodeHints, FetchOptions, Priority};
pub use pipeline::{Decryptor, Pipeline, RequestModifier, ResponseModifier, base64_decryptor};
pub use queue::ExecutionOrder;
pub use request::{FetchRequest, FetchResponse, RequestKey};
pub use reqwest::Url;
pub use token::DownloadToken;
pub use transport::{
    BodyStream, FileTransport, ReqwestTransport, SessionTransport, Transport, TransportResponse,
};
