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
//! # Basic Processor Example
//!
//! This module demonstrates a custom Envoy external processor that modifies
//! both HTTP headers and bodies in requests and responses.
//!
//! ## Overview
//!
//! The `BasicProcessor` implements the `Processor` trait to intercept and modify
//! HTTP traffic in four ways:
//!
//! 1. Adding custom headers to requests
//! 2. Adding custom headers to responses
//! 3. Replacing request body content
//! 4. Replacing response body content
//!
//! It also keeps a per-request counter of body chunks in its typed context
//! data, to show state carried from one phase to the next.
//!
//! ## Usage
//!
//! To run this example:
//!
//! ```bash
//! cargo run --example basic
//! ```

use async_trait::async_trait;
use ext_proc::{
    context::RequestContext,
    headers::Headers,
    options::ProcessingOptions,
    processor::{ProcessingError, Processor},
    server::CalloutServer,
};
use std::sync::Arc;

/// `BasicProcessor` demonstrates both header and body modifications for HTTP traffic.
///
/// This processor:
/// - Adds a "header-request" header to all requests
/// - Adds a "header-response" header to all responses, with the number of
///   request body chunks in "body-chunks"
/// - Replaces request bodies with "new-body-request"
/// - Replaces response bodies with "new-body-response"
#[derive(Clone, Default)]
struct BasicProcessor;

/// Data kept for one HTTP transaction.
#[derive(Default)]
struct BasicData {
    request_chunks: usize,
}

#[async_trait]
impl Processor for BasicProcessor {
    type Data = BasicData;

    fn name(&self) -> &str {
        "basic"
    }

    fn options(&self) -> ProcessingOptions {
        ProcessingOptions {
            update_extproc_header: true,
            ..Default::default()
        }
    }

    /// Adds a custom "header-request" header with value "Value-request" to all requests.
    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext<BasicData>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.append_header("header-request", "Value-request")?;
        ctx.continue_request();
        Ok(())
    }

    /// Replaces any request body with the string "new-body-request".
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context of the current HTTP transaction
    /// * `body` - The request body chunk
    async fn process_request_body(
        &self,
        ctx: &mut RequestContext<BasicData>,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        if !body.is_empty() {
            ctx.data_mut().request_chunks += 1;
            ctx.replace_body(b"new-body-request");
        }
        ctx.continue_request();
        Ok(())
    }

    /// Adds "header-response" and the request chunk count to all responses.
    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext<BasicData>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        let chunks = ctx.data().request_chunks.to_string();
        ctx.append_headers([
            ("header-response", "Value-response".to_string()),
            ("body-chunks", chunks),
        ])?;
        ctx.continue_request();
        Ok(())
    }

    /// Replaces any response body with the string "new-body-response".
    async fn process_response_body(
        &self,
        ctx: &mut RequestContext<BasicData>,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        if !body.is_empty() {
            ctx.replace_body(b"new-body-response");
        }
        ctx.continue_request();
        Ok(())
    }
}

/// Main entry point for the basic example.
///
/// Sets up and starts the external processor server with the `BasicProcessor`
/// and runs it until SIGINT or SIGTERM.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Using default config
    let server = CalloutServer::with_default_config();
    let processor = BasicProcessor;
    let options = processor.options();

    server.run(Arc::new(processor), options).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    //! Test module for the `BasicProcessor`.
    //!
    //! The tests run full phase messages through a `Dispatcher`, so they
    //! check the replies Envoy would actually receive.

    use super::*;
    use ext_proc::dispatcher::Dispatcher;
    use ext_proc::envoy::{
        config::core::v3::{HeaderMap, HeaderValue},
        service::ext_proc::v3::{
            body_mutation::Mutation as BodyMutationType, processing_request::Request,
            processing_response::Response as ProcessingResponseVariant, HttpBody, HttpHeaders,
            ProcessingRequest, ProcessingResponse,
        },
    };

    /// Creates a request headers message for `POST /items`.
    fn create_test_request_headers() -> ProcessingRequest {
        ProcessingRequest {
            request: Some(Request::RequestHeaders(HttpHeaders {
                headers: Some(HeaderMap {
                    headers: vec![
                        HeaderValue {
                            key: ":method".to_string(),
                            value: "POST".to_string(),
                            ..Default::default()
                        },
                        HeaderValue {
                            key: ":path".to_string(),
                            value: "/items".to_string(),
                            ..Default::default()
                        },
                        HeaderValue {
                            key: "host".to_string(),
                            raw_value: b"example.com".to_vec(),
                            ..Default::default()
                        },
                    ],
                }),
                end_of_stream: false,
            })),
        }
    }

    fn create_test_body(request: bool, body: &[u8]) -> ProcessingRequest {
        let http_body = HttpBody {
            body: body.to_vec(),
            end_of_stream: true,
        };
        ProcessingRequest {
            request: Some(if request {
                Request::RequestBody(http_body)
            } else {
                Request::ResponseBody(http_body)
            }),
        }
    }

    fn header_value(response: &ProcessingResponse, key: &str) -> Option<String> {
        let common = match &response.response {
            Some(ProcessingResponseVariant::RequestHeaders(r))
            | Some(ProcessingResponseVariant::ResponseHeaders(r)) => r.response.as_ref()?,
            Some(ProcessingResponseVariant::RequestBody(r))
            | Some(ProcessingResponseVariant::ResponseBody(r)) => r.response.as_ref()?,
            _ => return None,
        };
        common
            .header_mutation
            .as_ref()?
            .set_headers
            .iter()
            .filter_map(|option| option.header.as_ref())
            .find(|h| h.key == key)
            .map(|h| h.value.clone())
    }

    /// Tests that the custom request header is added.
    #[tokio::test]
    async fn test_process_request_headers() {
        let dispatcher = Dispatcher::new(Arc::new(BasicProcessor));
        let mut ctx = RequestContext::new();

        let response = dispatcher
            .dispatch(&mut ctx, &create_test_request_headers())
            .await
            .expect("Failed to process request headers");

        assert_eq!(
            header_value(&response, "header-request").as_deref(),
            Some("Value-request")
        );
    }

    /// Tests that the request body is replaced.
    #[tokio::test]
    async fn test_process_request_body() {
        let dispatcher = Dispatcher::new(Arc::new(BasicProcessor));
        let mut ctx = RequestContext::new();

        let response = dispatcher
            .dispatch(&mut ctx, &create_test_body(true, b"test request body"))
            .await
            .expect("Failed to process request body");

        if let Some(ProcessingResponseVariant::RequestBody(body_response)) = response.response {
            let body_mutation = body_response
                .response
                .as_ref()
                .unwrap()
                .body_mutation
                .as_ref()
                .unwrap();

            if let Some(BodyMutationType::Body(body)) = &body_mutation.mutation {
                assert_eq!(String::from_utf8_lossy(body), "new-body-request");
            } else {
                panic!("Expected body mutation");
            }
        } else {
            panic!("Unexpected response type");
        }
    }

    /// Tests a complete transaction.
    ///
    /// This test verifies that:
    /// - The chunk count set on the request body reaches the response headers
    /// - The response carries the processor name in x-extproc-names
    /// - The response body is replaced
    #[tokio::test]
    async fn test_full_transaction() {
        let dispatcher = Dispatcher::new(Arc::new(BasicProcessor));
        let mut ctx = RequestContext::new();

        dispatcher
            .dispatch(&mut ctx, &create_test_request_headers())
            .await
            .unwrap();
        dispatcher
            .dispatch(&mut ctx, &create_test_body(true, b"abc"))
            .await
            .unwrap();

        let response = dispatcher
            .dispatch(
                &mut ctx,
                &ProcessingRequest {
                    request: Some(Request::ResponseHeaders(HttpHeaders::default())),
                },
            )
            .await
            .unwrap();
        assert_eq!(header_value(&response, "body-chunks").as_deref(), Some("1"));
        assert_eq!(
            header_value(&response, "x-extproc-names").as_deref(),
            Some("basic")
        );

        let response = dispatcher
            .dispatch(&mut ctx, &create_test_body(false, b"upstream"))
            .await
            .unwrap();
        assert!(matches!(
            response.response,
            Some(ProcessingResponseVariant::ResponseBody(_))
        ));
    }
}
