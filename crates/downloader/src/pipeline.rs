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

use std::{fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::HeaderMap;

use crate::{
    context::FetchContext,
    request::{FetchRequest, FetchResponse},
};

/// Rewrites the request before dispatch. `None` rejects the fetch.
pub type RequestModifier = Arc<dyn Fn(FetchRequest) -> Option<FetchRequest> + Send + Sync>;

/// Rewrites response metadata before any body byte is delivered. `None`
/// rejects the response.
pub type ResponseModifier = Arc<dyn Fn(FetchResponse) -> Option<FetchResponse> + Send + Sync>;

/// Transforms the complete body before decoding. `None` rejects the payload.
pub type Decryptor = Arc<dyn Fn(Bytes, &FetchResponse) -> Option<Bytes> + Send + Sync>;

/// The three transform stages of a fetch. The downloader keeps one
/// engine-wide instance; each fetch resolves its own copy against the
/// per-call [`FetchContext`].
#[derive(Clone, Default)]
pub struct Pipeline {
    pub request_modifier:  Option<RequestModifier>,
    pub response_modifier: Option<ResponseModifier>,
    pub decryptor:         Option<Decryptor>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("request_modifier", &self.request_modifier.is_some())
            .field("response_modifier", &self.response_modifier.is_some())
            .field("decryptor", &self.decryptor.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Context entries win over the engine-wide stages.
    #[must_use]
    pub fn resolve(&self, context: &FetchContext) -> Self {
        Self {
            request_modifier:  context
                .request_modifier
                .clone()
                .or_else(|| self.request_modifier.clone()),
            response_modifier: context
                .response_modifier
                .clone()
                .or_else(|| self.response_modifier.clone()),
            decryptor:         context.decryptor.clone().or_else(|| self.decryptor.clone()),
        }
    }

    /// True when both pipelines run the same response modifier and
    /// decryptor, so an identical request yields an identical payload.
    #[must_use]
    pub fn same_payload_stages(&self, other: &Self) -> bool {
        same_stage(&self.response_modifier, &other.response_modifier)
            && same_stage(&self.decryptor, &other.decryptor)
    }

    pub fn modify_request(&self, request: FetchRequest) -> Option<FetchRequest> {
        match &self.request_modifier {
            Some(modifier) => modifier(request),
            None => Some(request),
        }
    }

    pub fn modify_response(&self, response: FetchResponse) -> Option<FetchResponse> {
        match &self.response_modifier {
            Some(modifier) => modifier(response),
            None => Some(response),
        }
    }

    pub fn decrypt(&self, body: Bytes, response: &FetchResponse) -> Option<Bytes> {
        match &self.decryptor {
            Some(decryptor) => decryptor(body, response),
            None => Some(body),
        }
    }

    /// A request modifier that inserts `headers`, replacing existing values
    /// for the same names.
    #[must_use]
    pub fn header_modifier(headers: HeaderMap) -> RequestModifier {
        Arc::new(move |mut request: FetchRequest| {
            for (name, value) in &headers {
                request.headers.insert(name.clone(), value.clone());
            }
            Some(request)
        })
    }
}

fn same_stage<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// A decryptor for bodies that arrive base64 encoded. Surrounding ASCII
/// whitespace is ignored; anything else that fails to decode rejects the
/// payload.
#[must_use]
pub fn base64_decryptor() -> Decryptor {
    Arc::new(|body: Bytes, _response: &FetchResponse| {
        STANDARD.decode(body.trim_ascii()).ok().map(Bytes::from)
    })
}
