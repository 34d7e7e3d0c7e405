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

use bon::Builder;
use smart_default::SmartDefault;
use snafu::ensure;
use strum_macros::{Display, EnumString};

use crate::error::{FetchError, InvalidOptionsSnafu};

/// Queue tier of a fetch. Higher tiers are always admitted first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Whether a transport may answer from a local protocol cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    ReloadIgnoringLocalCache,
    UseProtocolCachePolicy,
}

/// Hints forwarded untouched to the [`Decoder`](crate::Decoder).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Builder)]
pub struct DecodeHints {
    #[builder(default)]
    pub scale_down_large_images: bool,
    /// Skip the decoder entirely; the payload carries raw bytes only.
    #[builder(default)]
    pub avoid_decode:            bool,
    #[builder(default)]
    pub first_frame_only:        bool,
    #[builder(default)]
    pub preload_all_frames:      bool,
    #[builder(default)]
    pub match_concrete_class:    bool,
}

/// Per-fetch behaviour. Immutable once the fetch has been issued.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Builder)]
pub struct FetchOptions {
    #[builder(default)]
    pub priority:               Priority,
    /// Deliver partial decodes while bytes arrive.
    #[builder(default)]
    pub progressive:            bool,
    /// Let the transport consult its protocol cache. Without it the HTTP
    /// transport sends `Cache-Control: no-cache`. Reporting a cache hit
    /// through `FetchResponse::from_cache` is up to the transport.
    #[builder(default)]
    pub use_url_cache:          bool,
    /// Treat a cached or `304 Not Modified` answer as `CacheNotModified`.
    #[builder(default)]
    pub ignore_cached_response: bool,
    #[builder(default)]
    pub continue_in_background: bool,
    #[builder(default)]
    pub handle_cookies:         bool,
    /// Accept invalid TLS certificates. Meant for tests against self-signed
    /// servers.
    #[builder(default)]
    pub allow_invalid_tls:      bool,
    #[builder(default)]
    pub decode:                 DecodeHints,
    /// Allow joining an identical in-flight fetch when the downloader has
    /// coalescing enabled.
    #[default = true]
    #[builder(default = true)]
    pub allow_coalescing:       bool,
}

impl FetchOptions {
    pub const fn cache_policy(&self) -> CachePolicy {
        if self.use_url_cache {
            CachePolicy::UseProtocolCachePolicy
        } else {
            CachePolicy::ReloadIgnoringLocalCache
        }
    }

    /// Reject flag combinations that contradict each other.
    pub fn validate(&self) -> Result<(), FetchError> {
        let hints = &self.decode;
        ensure!(
            !(hints.first_frame_only && hints.match_concrete_class),
            InvalidOptionsSnafu {
                reason: "first_frame_only cannot be combined with match_concrete_class",
            }
        );
        ensure!(
            !(hints.first_frame_only && hints.preload_all_frames),
            InvalidOptionsSnafu {
                reason: "first_frame_only cannot be combined with preload_all_frames",
            }
        );
        Ok(())
    }
}
