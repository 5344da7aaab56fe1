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
//! # Mutations Utility Module
//!
//! This module stages the mutations a processor asks for during one phase and
//! turns them into the `ProcessingResponse` shape Envoy expects for that phase.
//!
//! ## Overview
//!
//! A [`PhaseResponse`] accumulates:
//!
//! - Header set operations, each with its own append action
//! - A de-duplicated list of headers to remove
//! - An optional body replacement or body clear
//! - The reply choice: continue, or an immediate response
//!
//! The wire reply is assembled only when [`PhaseResponse::build`] is called,
//! so anything staged after a processor chose its reply (for example the
//! duration header) still lands in the reply.
//!
//! ## Reply shapes
//!
//! | Phase             | Continue reply                   | Immediate response |
//! |-------------------|----------------------------------|--------------------|
//! | request headers   | `HeadersResponse(CommonResponse)`| allowed            |
//! | request body      | `BodyResponse(CommonResponse)`   | allowed            |
//! | request trailers  | `TrailersResponse(HeaderMutation)`| ignored           |
//! | response headers  | `HeadersResponse(CommonResponse)`| allowed            |
//! | response body     | `BodyResponse(CommonResponse)`   | allowed            |
//! | response trailers | `TrailersResponse(HeaderMutation)`| ignored           |

use crate::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue as WireHeaderValue, HeaderValueOption,
};
use crate::envoy::r#type::v3::HttpStatus;
use crate::envoy::service::ext_proc::v3::{
    body_mutation, processing_response::Response as ProcessingResponseType, BodyMutation,
    BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, ImmediateResponse,
    ProcessingResponse, TrailersResponse,
};
use crate::headers::HeaderValue;
use crate::phase::Phase;
use thiserror::Error;

pub const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("only one of 'value' or 'raw_value' can be set for header {name:?}")]
    ConflictingValue { name: String },
}

/// Which reply a processor selected for the current phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StagedReply {
    #[default]
    None,
    Continue,
    Immediate { status: u32, body: Vec<u8> },
}

/// Mutations staged during a single phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseResponse {
    header_mutation: HeaderMutation,
    body_mutation: Option<BodyMutation>,
    reply: StagedReply,
}

fn to_option(name: String, value: HeaderValue, action: HeaderAppendAction) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(WireHeaderValue {
            key: name,
            value: value.value,
            raw_value: value.raw_value.unwrap_or_default(),
        }),
        append_action: action as i32,
        keep_empty_value: false,
    }
}

impl PhaseResponse {
    /// Stages one header set operation.
    ///
    /// # Errors
    ///
    /// `MutationError::ConflictingValue` when `value` carries both text and
    /// raw bytes; nothing is staged in that case.
    pub fn update_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
        action: HeaderAppendAction,
    ) -> Result<(), MutationError> {
        let name = name.into();
        let value = value.into();
        if value.is_conflicting() {
            return Err(MutationError::ConflictingValue { name });
        }
        self.header_mutation
            .set_headers
            .push(to_option(name, value, action));
        Ok(())
    }

    /// Stages several header set operations with the same action. Every entry
    /// is checked before any is staged.
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
        let headers: Vec<(String, HeaderValue)> = headers
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        if let Some((name, _)) = headers.iter().find(|(_, value)| value.is_conflicting()) {
            return Err(MutationError::ConflictingValue { name: name.clone() });
        }
        self.header_mutation.set_headers.extend(
            headers
                .into_iter()
                .map(|(name, value)| to_option(name, value, action)),
        );
        Ok(())
    }

    pub fn remove_header(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.header_mutation.remove_headers.contains(&name) {
            self.header_mutation.remove_headers.push(name);
        }
    }

    pub fn remove_headers<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.remove_header(name);
        }
    }

    /// Replaces the body chunk and keeps `Content-Length` in step with it.
    /// An empty `body` stages nothing; use [`PhaseResponse::clear_body`] to
    /// drop a body.
    pub fn replace_body(&mut self, body: &[u8]) {
        if body.is_empty() {
            return;
        }
        self.body_mutation = Some(BodyMutation {
            mutation: Some(body_mutation::Mutation::Body(body.to_vec())),
        });
        self.header_mutation.set_headers.push(to_option(
            CONTENT_LENGTH.to_string(),
            HeaderValue::raw(body.len().to_string().into_bytes()),
            HeaderAppendAction::OverwriteIfExistsOrAdd,
        ));
    }

    pub fn clear_body(&mut self) {
        self.body_mutation = Some(BodyMutation {
            mutation: Some(body_mutation::Mutation::ClearBody(true)),
        });
    }

    pub fn continue_request(&mut self) {
        self.reply = StagedReply::Continue;
    }

    /// Selects an immediate response. `headers` are appended to the staged
    /// header mutation, which becomes the immediate response's headers.
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
        self.update_headers(headers, HeaderAppendAction::AppendIfExistsOrAdd)?;
        self.reply = StagedReply::Immediate {
            status,
            body: body.into(),
        };
        Ok(())
    }

    pub fn reset(&mut self) {
        self.header_mutation = HeaderMutation::default();
        self.body_mutation = None;
        self.reply = StagedReply::None;
    }

    pub fn header_mutation(&self) -> &HeaderMutation {
        &self.header_mutation
    }

    pub fn body_mutation(&self) -> Option<&BodyMutation> {
        self.body_mutation.as_ref()
    }

    pub fn staged_reply(&self) -> &StagedReply {
        &self.reply
    }

    /// Assembles the reply for `phase`, or `None` for `Phase::Undetermined`.
    ///
    /// A staged immediate response wins on the four headers/body phases.
    /// Anything else continues with the staged mutations; trailers replies
    /// only carry the header mutation.
    pub fn build(&mut self, phase: Phase) -> Option<ProcessingResponse> {
        if let StagedReply::Immediate { status, body } = &self.reply {
            if phase.allows_immediate_response() {
                let immediate_response = ImmediateResponse {
                    status: Some(HttpStatus {
                        code: *status as i32,
                    }),
                    headers: Some(self.header_mutation.clone()),
                    body: body.clone(),
                    ..Default::default()
                };
                return Some(wrap(ProcessingResponseType::ImmediateResponse(
                    immediate_response,
                )));
            }
        }

        self.continue_request();
        let common_response = || CommonResponse {
            header_mutation: Some(self.header_mutation.clone()),
            body_mutation: self.body_mutation.clone(),
            ..Default::default()
        };
        let trailers_response = || TrailersResponse {
            header_mutation: Some(self.header_mutation.clone()),
        };

        let response = match phase {
            Phase::RequestHeaders => ProcessingResponseType::RequestHeaders(HeadersResponse {
                response: Some(common_response()),
            }),
            Phase::RequestBody => ProcessingResponseType::RequestBody(BodyResponse {
                response: Some(common_response()),
            }),
            Phase::RequestTrailers => ProcessingResponseType::RequestTrailers(trailers_response()),
            Phase::ResponseHeaders => ProcessingResponseType::ResponseHeaders(HeadersResponse {
                response: Some(common_response()),
            }),
            Phase::ResponseBody => ProcessingResponseType::ResponseBody(BodyResponse {
                response: Some(common_response()),
            }),
            Phase::ResponseTrailers => {
                ProcessingResponseType::ResponseTrailers(trailers_response())
            }
            Phase::Undetermined => return None,
        };
        Some(wrap(response))
    }
}

fn wrap(response: ProcessingResponseType) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(response),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    //! Tests for the phase response builder.
    //!
    //! These tests verify the staging rules and that each phase gets the
    //! reply variant Envoy accepts for it.

    use super::*;

    fn header<'a>(mutation: &'a HeaderMutation, key: &str) -> Option<&'a HeaderValueOption> {
        mutation
            .set_headers
            .iter()
            .find(|option| option.header.as_ref().map(|h| h.key.as_str()) == Some(key))
    }

    /// Tests that each append mode maps to the matching wire action.
    #[test]
    fn test_update_header_actions() {
        let mut response = PhaseResponse::default();
        response
            .update_header("x-a", "1", HeaderAppendAction::AppendIfExistsOrAdd)
            .unwrap();
        response
            .update_header("x-b", "2", HeaderAppendAction::AddIfAbsent)
            .unwrap();
        response
            .update_header(
                "x-c",
                HeaderValue::raw(b"3".to_vec()),
                HeaderAppendAction::OverwriteIfExistsOrAdd,
            )
            .unwrap();

        let set = &response.header_mutation().set_headers;
        assert_eq!(set.len(), 3);
        assert_eq!(set[0].append_action(), HeaderAppendAction::AppendIfExistsOrAdd);
        assert_eq!(set[1].append_action(), HeaderAppendAction::AddIfAbsent);
        assert_eq!(set[2].append_action(), HeaderAppendAction::OverwriteIfExistsOrAdd);
        assert_eq!(set[0].header.as_ref().unwrap().value, "1");
        assert_eq!(set[2].header.as_ref().unwrap().raw_value, b"3");
    }

    /// Tests that a value with both representations is refused and nothing
    /// is staged.
    #[test]
    fn test_conflicting_value_stages_nothing() {
        let mut response = PhaseResponse::default();
        let both = HeaderValue {
            value: "a".to_string(),
            raw_value: Some(b"b".to_vec()),
        };

        let err = response
            .update_header("x-both", both.clone(), HeaderAppendAction::AddIfAbsent)
            .unwrap_err();
        assert_eq!(
            err,
            MutationError::ConflictingValue {
                name: "x-both".to_string()
            }
        );

        let err = response
            .update_headers(
                vec![("x-ok", HeaderValue::text("1")), ("x-both", both)],
                HeaderAppendAction::AddIfAbsent,
            )
            .unwrap_err();
        assert!(matches!(err, MutationError::ConflictingValue { .. }));
        assert!(response.header_mutation().set_headers.is_empty());
    }

    #[test]
    fn test_remove_header_is_idempotent() {
        let mut response = PhaseResponse::default();
        response.remove_header("cookie");
        response.remove_header("cookie");
        response.remove_headers(["cookie", "server", "server"]);

        assert_eq!(
            response.header_mutation().remove_headers,
            vec!["cookie".to_string(), "server".to_string()]
        );
    }

    /// Tests that replacing the body also sets `Content-Length`.
    #[test]
    fn test_replace_body_sets_content_length() {
        let mut response = PhaseResponse::default();
        response.replace_body(b"hello world");

        match response.body_mutation().and_then(|m| m.mutation.as_ref()) {
            Some(body_mutation::Mutation::Body(body)) => assert_eq!(body, b"hello world"),
            other => panic!("Expected Body mutation, got {:?}", other),
        }
        let content_length = header(response.header_mutation(), CONTENT_LENGTH).unwrap();
        assert_eq!(content_length.header.as_ref().unwrap().raw_value, b"11");
        assert_eq!(
            content_length.append_action(),
            HeaderAppendAction::OverwriteIfExistsOrAdd
        );
    }

    #[test]
    fn test_replace_body_with_empty_input_is_noop() {
        let mut response = PhaseResponse::default();
        response.replace_body(b"");

        assert!(response.body_mutation().is_none());
        assert!(response.header_mutation().set_headers.is_empty());
    }

    #[test]
    fn test_clear_body() {
        let mut response = PhaseResponse::default();
        response.clear_body();

        assert_eq!(
            response.body_mutation().unwrap().mutation,
            Some(body_mutation::Mutation::ClearBody(true))
        );
    }

    /// Tests that the last of continue/cancel wins.
    #[test]
    fn test_continue_and_cancel_replace_each_other() {
        let mut response = PhaseResponse::default();
        response.continue_request();
        response
            .cancel_request(403, Vec::<(String, HeaderValue)>::new(), "denied")
            .unwrap();
        assert_eq!(
            response.staged_reply(),
            &StagedReply::Immediate {
                status: 403,
                body: b"denied".to_vec()
            }
        );

        response.continue_request();
        assert_eq!(response.staged_reply(), &StagedReply::Continue);
        match response.build(Phase::RequestHeaders).unwrap().response {
            Some(ProcessingResponseType::RequestHeaders(_)) => {}
            other => panic!("Expected RequestHeaders response, got {:?}", other),
        }
    }

    /// Tests creating an immediate response.
    ///
    /// Verifies that:
    /// - The status code is correctly set
    /// - Extra headers are appended
    /// - Body content is correctly set
    #[test]
    fn test_immediate_response() {
        let mut response = PhaseResponse::default();
        response
            .update_header("x-early", "1", HeaderAppendAction::OverwriteIfExistsOrAdd)
            .unwrap();
        response
            .cancel_request(409, vec![("x-reason", "duplicate")], "conflict")
            .unwrap();

        match response.build(Phase::RequestBody).unwrap().response {
            Some(ProcessingResponseType::ImmediateResponse(immediate)) => {
                assert_eq!(immediate.status.unwrap().code, 409);
                assert_eq!(immediate.body, b"conflict");
                let headers = immediate.headers.unwrap();
                assert_eq!(headers.set_headers.len(), 2);
                assert_eq!(
                    header(&headers, "x-reason").unwrap().append_action(),
                    HeaderAppendAction::AppendIfExistsOrAdd
                );
            }
            other => panic!("Expected ImmediateResponse, got {:?}", other),
        }
    }

    /// Tests that trailers phases never surface an immediate response.
    #[test]
    fn test_trailers_ignore_immediate_response() {
        for phase in [Phase::RequestTrailers, Phase::ResponseTrailers] {
            let mut response = PhaseResponse::default();
            response.remove_header("grpc-status");
            response
                .cancel_request(500, Vec::<(String, HeaderValue)>::new(), "")
                .unwrap();

            let trailers = match response.build(phase).unwrap().response {
                Some(ProcessingResponseType::RequestTrailers(t))
                    if phase == Phase::RequestTrailers =>
                {
                    t
                }
                Some(ProcessingResponseType::ResponseTrailers(t))
                    if phase == Phase::ResponseTrailers =>
                {
                    t
                }
                other => panic!("Expected trailers response, got {:?}", other),
            };
            assert_eq!(
                trailers.header_mutation.unwrap().remove_headers,
                vec!["grpc-status".to_string()]
            );
        }
    }

    /// Tests that each headers/body phase gets its own continue variant.
    #[test]
    fn test_continue_variants() {
        let mut response = PhaseResponse::default();
        response.replace_body(b"new");

        let reply = response.build(Phase::ResponseBody).unwrap();
        match reply.response {
            Some(ProcessingResponseType::ResponseBody(body_response)) => {
                let common = body_response.response.unwrap();
                assert!(common.body_mutation.is_some());
                assert!(header(&common.header_mutation.unwrap(), CONTENT_LENGTH).is_some());
            }
            other => panic!("Expected ResponseBody response, got {:?}", other),
        }
        assert!(reply.mode_override.is_none());

        assert!(matches!(
            response.build(Phase::RequestBody).unwrap().response,
            Some(ProcessingResponseType::RequestBody(_))
        ));
        assert!(matches!(
            response.build(Phase::ResponseHeaders).unwrap().response,
            Some(ProcessingResponseType::ResponseHeaders(_))
        ));
        assert!(response.build(Phase::Undetermined).is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut response = PhaseResponse::default();
        response.remove_header("a");
        response.clear_body();
        response
            .cancel_request(400, vec![("x", "y")], "")
            .unwrap();

        response.reset();
        assert_eq!(response.header_mutation(), &HeaderMutation::default());
        assert!(response.body_mutation().is_none());
        assert_eq!(response.staged_reply(), &StagedReply::None);
    }
}
