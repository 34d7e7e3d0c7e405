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

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use bon::Builder;
use tokio::runtime::Handle;

use crate::pipeline::{Decryptor, RequestModifier, ResponseModifier};

/// Opaque value stored under an unrecognised context key.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Per-call overrides for a single fetch.
///
/// The typed fields are understood by the downloader. Everything in
/// `extras` is ignored by it and forwarded to the decoder.
#[derive(Clone, Default, Builder)]
pub struct FetchContext {
    pub request_modifier:  Option<RequestModifier>,
    pub response_modifier: Option<ResponseModifier>,
    pub decryptor:         Option<Decryptor>,
    /// Name of the concrete type the decoder should produce.
    #[builder(into)]
    pub decoded_type:      Option<String>,
    /// Runtime on which this fetch's callbacks run.
    pub callback_runtime:  Option<Handle>,
    #[builder(default)]
    pub extras:            HashMap<String, ContextValue>,
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("request_modifier", &self.request_modifier.is_some())
            .field("response_modifier", &self.response_modifier.is_some())
            .field("decryptor", &self.decryptor.is_some())
            .field("decoded_type", &self.decoded_type)
            .field("callback_runtime", &self.callback_runtime.is_some())
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FetchContext {
    #[must_use]
    pub fn with_extra<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.extras.insert(key.into(), Arc::new(value));
        self
    }

    pub fn extra<T: Any>(&self, key: &str) -> Option<&T> {
        self.extras.get(key).and_then(|value| value.downcast_ref::<T>())
    }
}
