// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! # Request Context Module
//!
//! A [`RequestContext`] lives for one ext_proc stream, that is one HTTP
//! transaction. It is initialized from the request headers phase and handed
//! to every processor callback of the stream, so data computed in one phase
//! can be read in a later one.
//!
//! Besides the request identity (method, path, ...) the context carries:
//!
//! - `data`: the processor's own typed state (`Processor::Data`)
//! - a string-keyed map of JSON values for loosely structured scratch data
//! - the mutations staged for the current phase
//! - the time spent inside callbacks so far

use crate::dispatcher::DispatchError;
use crate::envoy::config::core::v3::{header_value_option::HeaderAppendAction, HeaderMap};
use crate::envoy::service::ext_proc::v3::ProcessingResponse;
use crate::headers::{HeaderError, HeaderValue, Headers};
use crate::phase::Phase;
use crate::utils::mutations::{MutationError, PhaseResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("{0} does not exist")]
    NotFound(String),
}

/// Per-stream state shared by all phases of one HTTP transaction.
#[derive(Debug)]
pub struct RequestContext<D = ()> {
    pub scheme: String,
    pub authority: String,
    pub method: String,
    /// `full_path` without its query string.
    pub path: String,
    pub full_path: String,
    pub request_id: String,
    /// Request headers, without the pseudo-headers and `x-request-id`.
    pub headers: Headers,

    pub(crate) started_at: SystemTime,
    pub(crate) elapsed: Duration,
    pub(crate) end_of_stream: bool,

    data: D,
    values: HashMap<String, Value>,
    response: PhaseResponse,
}

impl<D: Default> Default for RequestContext<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Default> RequestContext<D> {
    pub fn new() -> Self {
        Self {
            scheme: String::new(),
            authority: String::new(),
            method: String::new(),
            path: String::new(),
            full_path: String::new(),
            request_id: String::new(),
            headers: Headers::default(),
            started_at: SystemTime::now(),
            elapsed: Duration::ZERO,
            end_of_stream: false,
            data: D::default(),
            values: HashMap::new(),
            response: PhaseResponse::default(),
        }
    }

    /// (Re)initializes the context from a request headers message.
    ///
    /// The identity fields are always extracted. When the header list is
    /// malformed the general header mapping is left empty and the decoding
    /// error is returned.
    pub(crate) fn init(
        &mut self,
        header_map: Option<&HeaderMap>,
        end_of_stream: bool,
    ) -> Result<(), HeaderError> {
        *self = Self::new();
        self.end_of_stream = end_of_stream;

        if let Some(header_map) = header_map {
            for h in &header_map.headers {
                let value = if h.raw_value.is_empty() {
                    h.value.clone()
                } else {
                    String::from_utf8_lossy(&h.raw_value).into_owned()
                };
                match h.key.as_str() {
                    ":scheme" => self.scheme = value,
                    ":authority" => self.authority = value,
                    ":method" => self.method = value,
                    ":path" => {
                        self.path = value.split('?').next().unwrap_or_default().to_string();
                        self.full_path = value;
                    }
                    "x-request-id" => self.request_id = value,
                    _ => {}
                }
            }
        }

        self.headers = Headers::from_wire(header_map)?;
        Ok(())
    }
}

impl<D> RequestContext<D> {
    /// Wall-clock time at which the request headers were received.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Total time spent inside processor callbacks on this stream.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether the current message is the last one for its phase.
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get_value(&self, key: &str) -> Result<&Value, ContextError> {
        self.values
            .get(key)
            .ok_or_else(|| ContextError::NotFound(key.to_string()))
    }

    pub fn update_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
        action: HeaderAppendAction,
    ) -> Result<(), MutationError> {
        self.response.update_header(name, value, action)
    }

    pub fn append_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Result<(), MutationError> {
        self.update_header(name, value, HeaderAppendAction::AppendIfExistsOrAdd)
    }

    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Result<(), MutationError> {
        self.update_header(name, value, HeaderAppendAction::AddIfAbsent)
    }

    pub fn overwrite_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Result<(), MutationError> {
        self.update_header(name, value, HeaderAppendAction::OverwriteIfExistsOrAdd)
    }

    pub fn update_headers<I, K, V>(
        &mut self,
        headers: I,
        action: HeaderAppendAction,
    ) -> Result<(), MutationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        self.response.update_headers(headers, action)
    }

    pub fn append_headers<I, K, V>(&mut self, headers: I) -> Result<(), MutationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        self.update_headers(headers, HeaderAppendAction::AppendIfExistsOrAdd)
    }

    pub fn add_headers<I, K, V>(&mut self, headers: I) -> Result<(), MutationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        self.update_headers(headers, HeaderAppendAction::AddIfAbsent)
    }

    pub fn overwrite_headers<I, K, V>(&mut self, headers: I) -> Result<(), MutationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        self.update_headers(headers, HeaderAppendAction::OverwriteIfExistsOrAdd)
    }

    pub fn remove_header(&mut self, name: impl Into<String>) {
        self.response.remove_header(name);
    }

    pub fn remove_headers<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.response.remove_headers(names);
    }

    pub fn replace_body(&mut self, body: &[u8]) {
        self.response.replace_body(body);
    }

    pub fn clear_body(&mut self) {
        self.response.clear_body();
    }

    pub fn continue_request(&mut self) {
        self.response.continue_request();
    }

    pub fn cancel_request<I, K, V>(
        &mut self,
        status: u32,
        headers: I,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), MutationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        log::info!("Cancelling request {} with status {}", self.request_id, status);
        self.response.cancel_request(status, headers, body)
    }

    /// Mutations staged so far in the current phase.
    pub fn response(&self) -> &PhaseResponse {
        &self.response
    }

    pub(crate) fn reset_phase(&mut self) {
        self.end_of_stream = false;
        self.response.reset();
    }

    pub fn get_reply(&mut self, phase: Phase) -> Result<ProcessingResponse, DispatchError> {
        self.response
            .build(phase)
            .ok_or(DispatchError::UnknownPhase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoy::config::core::v3::HeaderValue as WireHeaderValue;
    use crate::envoy::service::ext_proc::v3::processing_response::Response as ProcessingResponseVariant;
    use crate::utils::mutations::StagedReply;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        HeaderMap {
            headers: pairs
                .iter()
                .map(|(key, value)| WireHeaderValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn test_init_extracts_identity() {
        let mut ctx: RequestContext = RequestContext::new();
        let map = header_map(&[
            (":scheme", "https"),
            (":authority", "example.com"),
            (":method", "POST"),
            (":path", "/items/7?expand=true"),
            ("x-request-id", "req-1"),
            ("content-type", "application/json"),
        ]);
        ctx.init(Some(&map), true).unwrap();

        assert_eq!(ctx.scheme, "https");
        assert_eq!(ctx.authority, "example.com");
        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.full_path, "/items/7?expand=true");
        assert_eq!(ctx.path, "/items/7");
        assert_eq!(ctx.request_id, "req-1");
        assert!(ctx.end_of_stream());
        assert_eq!(ctx.headers.len(), 1);
        assert_eq!(ctx.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_init_decodes_raw_pseudo_headers() {
        let mut ctx: RequestContext = RequestContext::new();
        let map = HeaderMap {
            headers: vec![WireHeaderValue {
                key: ":method".to_string(),
                raw_value: b"PUT".to_vec(),
                ..Default::default()
            }],
        };
        ctx.init(Some(&map), false).unwrap();
        assert_eq!(ctx.method, "PUT");
    }

    #[test]
    fn test_init_with_malformed_headers_keeps_identity() {
        let mut ctx: RequestContext = RequestContext::new();
        let mut map = header_map(&[(":method", "GET"), (":path", "/x")]);
        map.headers.push(WireHeaderValue {
            key: "x-both".to_string(),
            value: "a".to_string(),
            raw_value: b"b".to_vec(),
        });

        assert!(ctx.init(Some(&map), true).is_err());
        assert_eq!(ctx.method, "GET");
        assert_eq!(ctx.path, "/x");
        assert!(ctx.headers.is_empty());
    }

    #[test]
    fn test_init_resets_scratch_space() {
        let mut ctx: RequestContext<u32> = RequestContext::new();
        ctx.set_value("seen", true);
        *ctx.data_mut() = 7;
        ctx.elapsed = Duration::from_millis(3);

        ctx.init(None, false).unwrap();
        assert_eq!(ctx.get_value("seen"), Err(ContextError::NotFound("seen".to_string())));
        assert_eq!(*ctx.data(), 0);
        assert_eq!(ctx.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_values_round_trip() {
        let mut ctx: RequestContext = RequestContext::new();
        ctx.set_value("digest", "abc");
        assert_eq!(ctx.get_value("digest").unwrap(), "abc");
        assert!(ctx.get_value("missing").is_err());
    }

    #[test]
    fn test_reset_phase_discards_staged_mutations() {
        let mut ctx: RequestContext = RequestContext::new();
        ctx.end_of_stream = true;
        ctx.append_header("x-a", "1").unwrap();
        ctx.clear_body();
        ctx.cancel_request(401, Vec::<(String, String)>::new(), "").unwrap();

        ctx.reset_phase();
        assert!(!ctx.end_of_stream());
        assert!(ctx.response().header_mutation().set_headers.is_empty());
        assert!(ctx.response().body_mutation().is_none());
        assert_eq!(ctx.response().staged_reply(), &StagedReply::None);
    }

    #[test]
    fn test_get_reply_for_unknown_phase() {
        let mut ctx: RequestContext = RequestContext::new();
        assert!(matches!(
            ctx.get_reply(Phase::Undetermined),
            Err(DispatchError::UnknownPhase)
        ));
    }

    #[test]
    fn test_get_reply_continues_implicitly() {
        let mut ctx: RequestContext = RequestContext::new();
        ctx.overwrite_header("x-b", HeaderValue::raw(b"2".to_vec())).unwrap();

        let reply = ctx.get_reply(Phase::RequestHeaders).unwrap();
        match reply.response {
            Some(ProcessingResponseVariant::RequestHeaders(headers_response)) => {
                let mutation = headers_response.response.unwrap().header_mutation.unwrap();
                assert_eq!(mutation.set_headers.len(), 1);
            }
            other => panic!("Expected RequestHeaders response, got {:?}", other),
        }
        assert_eq!(ctx.response().staged_reply(), &StagedReply::Continue);
    }
}
