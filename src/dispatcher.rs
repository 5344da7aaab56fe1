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
//! # Phase Dispatcher
//!
//! Routes one `ProcessingRequest` to the matching [`Processor`] callback and
//! builds the reply for it.
//!
//! ## Steps per message
//!
//! 1. Discard whatever the previous phase staged
//! 2. Refresh the context from the payload (request headers reinitialize it)
//! 3. Run the callback and add its wall-clock time to the context
//! 4. Add the provenance and duration headers on response phases
//! 5. Assemble the reply for the phase

use crate::context::RequestContext;
use crate::envoy::config::core::v3::HeaderMap;
use crate::envoy::service::ext_proc::v3::{
    processing_request::Request as ProcessingRequestType, ProcessingRequest, ProcessingResponse,
};
use crate::headers::Headers;
use crate::options::ProcessingOptions;
use crate::phase::Phase;
use crate::processor::{ProcessingError, Processor};
use crate::utils::mutations::MutationError;
use log::warn;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Appended on response headers with the processor's name.
pub const EXTPROC_NAMES_HEADER: &str = "x-extproc-names";
/// Set on the last response headers/body message with the callback time.
pub const DURATION_HEADER: &str = "x-extproc-duration-ns";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown processing phase")]
    UnknownPhase,
    #[error(transparent)]
    Callback(#[from] ProcessingError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

pub struct Dispatcher<P: Processor> {
    processor: Arc<P>,
    options: ProcessingOptions,
}

impl<P: Processor> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            options: self.options.clone(),
        }
    }
}

fn decode(header_map: Option<&HeaderMap>, phase: Phase) -> Headers {
    Headers::from_wire(header_map).unwrap_or_else(|e| {
        warn!("Ignoring malformed {} headers: {}", phase, e);
        Headers::default()
    })
}

impl<P: Processor> Dispatcher<P> {
    /// Uses the processor's own options.
    pub fn new(processor: Arc<P>) -> Self {
        let options = processor.options();
        Self::with_options(processor, options)
    }

    pub fn with_options(processor: Arc<P>, options: ProcessingOptions) -> Self {
        Self { processor, options }
    }

    pub fn options(&self) -> &ProcessingOptions {
        &self.options
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Runs one phase against `ctx` and returns the reply for it.
    ///
    /// # Errors
    ///
    /// - `DispatchError::UnknownPhase` for a message without a payload; the
    ///   callback is not invoked.
    /// - `DispatchError::Callback` when the callback fails; no reply is built.
    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext<P::Data>,
        req: &ProcessingRequest,
    ) -> Result<ProcessingResponse, DispatchError> {
        let phase = Phase::of(req);
        ctx.reset_phase();

        let Some(request) = &req.request else {
            return Err(DispatchError::UnknownPhase);
        };

        let result = match request {
            ProcessingRequestType::RequestHeaders(http_headers) => {
                if let Err(e) = ctx.init(http_headers.headers.as_ref(), http_headers.end_of_stream)
                {
                    warn!("Ignoring malformed request headers: {}", e);
                }
                let headers = ctx.headers.clone();
                let start = Instant::now();
                let result = self.processor.process_request_headers(ctx, &headers).await;
                ctx.elapsed += start.elapsed();
                result
            }
            ProcessingRequestType::RequestBody(http_body) => {
                ctx.end_of_stream = http_body.end_of_stream;
                let start = Instant::now();
                let result = self
                    .processor
                    .process_request_body(ctx, &http_body.body)
                    .await;
                ctx.elapsed += start.elapsed();
                result
            }
            ProcessingRequestType::RequestTrailers(http_trailers) => {
                let trailers = decode(http_trailers.trailers.as_ref(), phase);
                let start = Instant::now();
                let result = self
                    .processor
                    .process_request_trailers(ctx, &trailers)
                    .await;
                ctx.elapsed += start.elapsed();
                result
            }
            ProcessingRequestType::ResponseHeaders(http_headers) => {
                ctx.end_of_stream = http_headers.end_of_stream;
                let headers = decode(http_headers.headers.as_ref(), phase);
                let start = Instant::now();
                let result = self
                    .processor
                    .process_response_headers(ctx, &headers)
                    .await;
                ctx.elapsed += start.elapsed();
                result
            }
            ProcessingRequestType::ResponseBody(http_body) => {
                ctx.end_of_stream = http_body.end_of_stream;
                let start = Instant::now();
                let result = self
                    .processor
                    .process_response_body(ctx, &http_body.body)
                    .await;
                ctx.elapsed += start.elapsed();
                result
            }
            ProcessingRequestType::ResponseTrailers(http_trailers) => {
                let trailers = decode(http_trailers.trailers.as_ref(), phase);
                let start = Instant::now();
                let result = self
                    .processor
                    .process_response_trailers(ctx, &trailers)
                    .await;
                ctx.elapsed += start.elapsed();
                result
            }
        };
        result?;

        self.decorate(ctx, phase)?;
        ctx.get_reply(phase)
    }

    /// Adds the provenance and duration headers enabled in the options.
    pub(crate) fn decorate(
        &self,
        ctx: &mut RequestContext<P::Data>,
        phase: Phase,
    ) -> Result<(), DispatchError> {
        if phase == Phase::ResponseHeaders && self.options.update_extproc_header {
            ctx.append_header(EXTPROC_NAMES_HEADER, self.processor.name())?;
        }
        if matches!(phase, Phase::ResponseHeaders | Phase::ResponseBody)
            && ctx.end_of_stream()
            && self.options.update_duration_header
        {
            let elapsed_ns = ctx.elapsed().as_nanos().to_string();
            ctx.overwrite_header(DURATION_HEADER, elapsed_ns)?;
        }
        Ok(())
    }

    /// Plain continue reply for `phase`, dropping anything a failed callback
    /// staged.
    pub(crate) fn fallback_reply(
        &self,
        ctx: &mut RequestContext<P::Data>,
        phase: Phase,
    ) -> Result<ProcessingResponse, DispatchError> {
        let end_of_stream = ctx.end_of_stream;
        ctx.reset_phase();
        ctx.end_of_stream = end_of_stream;
        ctx.continue_request();
        ctx.get_reply(phase)
    }
}
