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
//! # Request Deduplication
//!
//! Rejects a mutating request (`PUT`, `POST`, `PATCH`) with `409 Conflict`
//! while an identical one is still in flight. Requests are identified by the
//! digest from [`super::digest`]; a digest is admitted once and released when
//! the admitted request's response comes back, or when its stream ends
//! without one.
//!
//! The in-flight set is shared by every stream, so it is a [`DashMap`]
//! handed to the processor at construction.

use super::digest::{RequestDigest, DIGEST_HEADER};
use crate::context::RequestContext;
use crate::headers::Headers;
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

pub const CONFLICT: u32 = 409;

/// Digests of admitted requests still waiting for their response.
pub type InFlight = Arc<DashMap<String, ()>>;

/// Keeps a digest in the in-flight set until dropped.
#[derive(Debug)]
struct Admission {
    in_flight: InFlight,
    digest: String,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.in_flight.remove(&self.digest);
    }
}

#[derive(Debug, Default)]
pub struct DedupState {
    digest: RequestDigest,
    admission: Option<Admission>,
}

#[derive(Debug, Default, Clone)]
pub struct DedupProcessor {
    in_flight: InFlight,
}

fn is_dedupable(method: &str) -> bool {
    matches!(method, "PUT" | "POST" | "PATCH")
}

impl DedupProcessor {
    pub fn new(in_flight: InFlight) -> Self {
        Self { in_flight }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Finalizes the digest, then admits or rejects the request.
    fn finish_request(&self, ctx: &mut RequestContext<DedupState>) -> Result<(), ProcessingError> {
        let digest = ctx.data_mut().digest.finish().to_string();
        ctx.add_header(DIGEST_HEADER, digest.clone())?;

        if is_dedupable(&ctx.method) {
            if self.in_flight.insert(digest.clone(), ()).is_some() {
                debug!("Rejecting duplicate request {}", digest);
                ctx.cancel_request(CONFLICT, Vec::<(String, String)>::new(), "")?;
                return Ok(());
            }
            ctx.data_mut().admission = Some(Admission {
                in_flight: self.in_flight.clone(),
                digest,
            });
        }
        ctx.continue_request();
        Ok(())
    }

    fn finish_response(&self, ctx: &mut RequestContext<DedupState>) -> Result<(), ProcessingError> {
        let digest = ctx.data().digest.digest().map(str::to_string);
        if let Some(digest) = digest {
            ctx.data_mut().admission.take();
            if ctx.end_of_stream() {
                ctx.add_header(DIGEST_HEADER, digest)?;
            }
        }
        ctx.continue_request();
        Ok(())
    }
}

#[async_trait]
impl Processor for DedupProcessor {
    type Data = DedupState;

    fn name(&self) -> &str {
        "dedup"
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext<DedupState>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        let (method, path) = (ctx.method.clone(), ctx.path.clone());
        ctx.data_mut().digest.start(&method, &path);
        if ctx.end_of_stream() {
            return self.finish_request(ctx);
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_request_body(
        &self,
        ctx: &mut RequestContext<DedupState>,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        ctx.data_mut().digest.update_body(body);
        if ctx.end_of_stream() {
            return self.finish_request(ctx);
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext<DedupState>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        self.finish_response(ctx)
    }

    async fn process_response_body(
        &self,
        ctx: &mut RequestContext<DedupState>,
        _body: &[u8],
    ) -> Result<(), ProcessingError> {
        self.finish_response(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::envoy::config::core::v3::{HeaderMap, HeaderValue};
    use crate::envoy::service::ext_proc::v3::{
        processing_request::Request, processing_response::Response as ProcessingResponseType,
        HttpHeaders, ProcessingRequest,
    };
    use crate::utils::mutations::StagedReply;

    fn context(method: &str, path: &str) -> RequestContext<DedupState> {
        let mut ctx = RequestContext::new();
        ctx.method = method.to_string();
        ctx.path = path.to_string();
        ctx
    }

    async fn send_request(processor: &DedupProcessor, ctx: &mut RequestContext<DedupState>) {
        processor
            .process_request_headers(ctx, &Headers::default())
            .await
            .unwrap();
        ctx.reset_phase();
        ctx.end_of_stream = true;
        processor
            .process_request_body(ctx, b"{\"id\":1}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_post_is_rejected_while_in_flight() {
        let processor = DedupProcessor::default();
        let mut first = context("POST", "/orders");
        let mut second = context("POST", "/orders");

        send_request(&processor, &mut first).await;
        assert_eq!(first.response().staged_reply(), &StagedReply::Continue);
        assert_eq!(processor.in_flight().len(), 1);

        send_request(&processor, &mut second).await;
        assert!(matches!(
            second.response().staged_reply(),
            StagedReply::Immediate { status: CONFLICT, .. }
        ));

        first.reset_phase();
        first.end_of_stream = true;
        processor
            .process_response_headers(&mut first, &Headers::default())
            .await
            .unwrap();
        assert!(processor.in_flight().is_empty());

        let mut third = context("POST", "/orders");
        send_request(&processor, &mut third).await;
        assert_eq!(third.response().staged_reply(), &StagedReply::Continue);
    }

    #[tokio::test]
    async fn test_safe_methods_are_not_deduplicated() {
        let processor = DedupProcessor::default();
        for _ in 0..2 {
            let mut ctx = context("GET", "/orders");
            ctx.end_of_stream = true;
            processor
                .process_request_headers(&mut ctx, &Headers::default())
                .await
                .unwrap();
            assert_eq!(ctx.response().staged_reply(), &StagedReply::Continue);
        }
        assert!(processor.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_request_does_not_release_the_original() {
        let in_flight = InFlight::default();
        let processor = DedupProcessor::new(in_flight.clone());
        let mut first = context("PUT", "/a");
        let mut second = context("PUT", "/a");
        send_request(&processor, &mut first).await;
        send_request(&processor, &mut second).await;

        second.reset_phase();
        processor
            .process_response_headers(&mut second, &Headers::default())
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_stream_releases_its_digest() {
        let processor = DedupProcessor::default();
        let mut first = context("POST", "/orders");
        first.end_of_stream = true;
        processor
            .process_request_headers(&mut first, &Headers::default())
            .await
            .unwrap();
        assert_eq!(first.response().staged_reply(), &StagedReply::Continue);
        assert_eq!(processor.in_flight().len(), 1);

        drop(first);
        assert!(processor.in_flight().is_empty());

        let mut second = context("POST", "/orders");
        second.end_of_stream = true;
        processor
            .process_request_headers(&mut second, &Headers::default())
            .await
            .unwrap();
        assert_eq!(second.response().staged_reply(), &StagedReply::Continue);
    }

    #[tokio::test]
    async fn test_new_request_on_stream_releases_previous_digest() {
        let dispatcher = Dispatcher::new(Arc::new(DedupProcessor::default()));
        let mut ctx = RequestContext::new();
        let post = ProcessingRequest {
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
                            value: "/orders".to_string(),
                            ..Default::default()
                        },
                    ],
                }),
                end_of_stream: true,
            })),
        };

        for _ in 0..2 {
            let reply = dispatcher.dispatch(&mut ctx, &post).await.unwrap();
            assert!(matches!(
                reply.response,
                Some(ProcessingResponseType::RequestHeaders(_))
            ));
            assert_eq!(dispatcher.processor().in_flight().len(), 1);
        }
    }
}
