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
use crate::context::RequestContext;
use crate::headers::{HeaderValue, Headers};
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;

pub const REQUEST_SEEN_HEADER: &str = "x-extproc-request";
pub const RESPONSE_SEEN_HEADER: &str = "x-extproc-response";

/// Marks requests and responses it has seen with a raw `seen` header.
#[derive(Debug, Default, Clone)]
pub struct TrivialProcessor;

#[async_trait]
impl Processor for TrivialProcessor {
    type Data = ();

    fn name(&self) -> &str {
        "trivial"
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.add_header(REQUEST_SEEN_HEADER, HeaderValue::raw(b"seen".to_vec()))?;
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_body(
        &self,
        ctx: &mut RequestContext,
        _body: &[u8],
    ) -> Result<(), ProcessingError> {
        ctx.add_header(RESPONSE_SEEN_HEADER, HeaderValue::raw(b"seen".to_vec()))?;
        ctx.continue_request();
        Ok(())
    }
}
