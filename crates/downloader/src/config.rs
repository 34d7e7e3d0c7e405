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

use std::ops::Range;

use bon::Builder;
use jiff::SignedDuration;
use smart_default::SmartDefault;
use tokio::runtime::Handle;

use crate::queue::ExecutionOrder;

pub const DEFAULT_ACCEPT: &str = "image/*,*/*;q=0.8";

/// Username and password sent as HTTP basic authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// Configuration for the downloader
#[derive(Debug, Clone, SmartDefault, Builder)]
pub struct DownloaderConfig {
    /// Operations executing at once (default: 6). Adjustable later through
    /// `Downloader::set_max_concurrent_downloads`.
    #[default = 6]
    #[builder(default = 6)]
    pub max_concurrent_downloads: usize,

    /// Timeout for each request (default: 15s)
    #[default(SignedDuration::from_secs(15))]
    #[builder(default = SignedDuration::from_secs(15))]
    pub timeout: SignedDuration,

    #[builder(default)]
    pub execution_order: ExecutionOrder,

    /// Let identical fetches share one operation (default: off)
    #[builder(default)]
    pub coalesce_requests: bool,

    /// `User-Agent` sent with every request
    #[default(default_user_agent())]
    #[builder(default = default_user_agent())]
    pub user_agent: String,

    /// `Accept` sent with every request
    #[default(DEFAULT_ACCEPT.to_string())]
    #[builder(default = DEFAULT_ACCEPT.to_string())]
    pub accept: String,

    pub credentials: Option<Credentials>,

    /// HTTP statuses treated as success (default: 200..400)
    #[default(200..400)]
    #[builder(default = 200..400)]
    pub acceptable_status_codes: Range<u16>,

    /// MIME types treated as success. `None` accepts any.
    pub acceptable_content_types: Option<Vec<String>>,

    /// Smallest fraction of the expected length between two progress
    /// reports; `0.0` reports every chunk.
    #[default = 0.0]
    #[builder(default = 0.0)]
    pub minimum_progress_interval: f64,

    /// Runtime operations execute on (default: the global transfer runtime)
    pub runtime: Option<Handle>,

    /// Runtime callbacks are delivered on (default: the global delivery
    /// runtime)
    pub callback_runtime: Option<Handle>,

    /// Buffered lifecycle events per receiver
    #[default = 256]
    #[builder(default = 256)]
    pub lifecycle_capacity: usize,
}

fn default_user_agent() -> String { format!("pixload/{}", env!("CARGO_PKG_VERSION")) }
