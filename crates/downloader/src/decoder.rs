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

use std::{any::Any, collections::HashMap, sync::Arc};

use bytes::Bytes;

use crate::{
    context::{ContextValue, FetchContext},
    error::DecodeError,
    options::DecodeHints,
    request::FetchResponse,
};

/// Whatever a decoder produces. Callers downcast to the concrete type.
pub type Decoded = Arc<dyn Any + Send + Sync>;

/// What a decoder gets to see besides the bytes.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub hints:        DecodeHints,
    pub decoded_type: Option<&'a str>,
    pub extras:       &'a HashMap<String, ContextValue>,
}

impl<'a> DecodeContext<'a> {
    pub fn new(hints: DecodeHints, context: &'a FetchContext) -> Self {
        Self {
            hints,
            decoded_type: context.decoded_type.as_deref(),
            extras: &context.extras,
        }
    }
}

/// Turns downloaded bytes into a decoded value.
///
/// Runs on the transfer runtime. With progressive fetches it is called for
/// every received chunk with `is_final == false`; failures of those partial
/// calls are ignored.
pub trait Decoder: Send + Sync + 'static {
    fn decode(
        &self,
        bytes: &Bytes,
        response: &FetchResponse,
        context: &DecodeContext<'_>,
        is_final: bool,
    ) -> Result<Decoded, DecodeError>;
}

/// Hands the raw bytes back unchanged, as a [`Bytes`] value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
    fn decode(
        &self,
        bytes: &Bytes,
        _response: &FetchResponse,
        _context: &DecodeContext<'_>,
        _is_final: bool,
    ) -> Result<Decoded, DecodeError> {
        Ok(Arc::new(bytes.clone()))
    }
}
