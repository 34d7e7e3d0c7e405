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

use http::{HeaderMap, Method, StatusCode, header};
use jiff::SignedDuration;
use reqwest::Url;

use crate::options::CachePolicy;

/// The effective request of a fetch, after engine defaults and the request
/// modifier have been applied.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url:               Url,
    pub method:            Method,
    pub headers:           HeaderMap,
    pub timeout:           Option<SignedDuration>,
    pub cache_policy:      CachePolicy,
    pub handle_cookies:    bool,
    pub allow_invalid_tls: bool,
    /// Informational: the caller asked for the transfer to outlive its
    /// foreground context.
    pub background:        bool,
}

impl FetchRequest {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            timeout: None,
            cache_policy: CachePolicy::default(),
            handle_cookies: false,
            allow_invalid_tls: false,
            background: false,
        }
    }

    /// Identity used to coalesce fetches: URL, method and headers.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        let mut headers: Vec<(String, Vec<u8>)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
            .collect();
        headers.sort();
        RequestKey {
            url: self.url.as_str().to_owned(),
            method: self.method.as_str().to_owned(),
            headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    url:     String,
    method:  String,
    headers: Vec<(String, Vec<u8>)>,
}

/// Response metadata, available once headers have arrived.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Final URL after redirects.
    pub url:          Url,
    pub status:       StatusCode,
    pub headers:      HeaderMap,
    pub expected_len: Option<u64>,
    /// The transport answered from a local cache.
    pub from_cache:   bool,
}

impl FetchResponse {
    #[must_use]
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            expected_len: None,
            from_cache: false,
        }
    }

    /// MIME essence of `Content-Type`, lowercased and without parameters.
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        let raw = self.headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
        let essence = raw.split(';').next()?.trim();
        (!essence.is_empty()).then(|| essence.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn url(s: &str) -> Url { Url::parse(s).unwrap() }

    #[test]
    fn key_ignores_header_insertion_order() {
        let mut a = FetchRequest::get(url("https://example.com/a.png"));
        a.headers.insert("x-one", HeaderValue::from_static("1"));
        a.headers.insert("x-two", HeaderValue::from_static("2"));

        let mut b = FetchRequest::get(url("https://example.com/a.png"));
        b.headers.insert("x-two", HeaderValue::from_static("2"));
        b.headers.insert("x-one", HeaderValue::from_static("1"));
        assert_eq!(a.key(), b.key());

        b.headers.insert("x-two", HeaderValue::from_static("3"));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn key_distinguishes_url_and_method() {
        let a = FetchRequest::get(url("https://example.com/a.png"));
        let b = FetchRequest::get(url("https://example.com/b.png"));
        assert_ne!(a.key(), b.key());

        let mut head = a.clone();
        head.method = Method::HEAD;
        assert_ne!(a.key(), head.key());
    }

    #[test]
    fn content_type_strips_parameters() {
        let mut response = FetchResponse::new(url("https://example.com/a"), StatusCode::OK);
        assert_eq!(response.content_type(), None);

        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Image/PNG; charset=binary"),
        );
        assert_eq!(response.content_type().as_deref(), Some("image/png"));
    }
}
