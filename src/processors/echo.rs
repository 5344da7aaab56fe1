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
use crate::headers::Headers;
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;
use regex::Regex;

pub const ECHO_PATH_PATTERN: &str = "/echo/.*";

/// Answers requests on echo paths itself, with `200`, the request headers
/// and the request body. Other requests continue to the upstream.
#[derive(Debug, Clone)]
pub struct EchoProcessor {
    path_pattern: Regex,
}

impl EchoProcessor {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_pattern(ECHO_PATH_PATTERN)
    }

    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            path_pattern: Regex::new(pattern)?,
        })
    }

    fn echo(
        &self,
        ctx: &mut RequestContext,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        let headers = ctx.headers.joined();
        ctx.cancel_request(200, headers, body)?;
        Ok(())
    }
}

#[async_trait]
impl Processor for EchoProcessor {
    type Data = ();

    fn name(&self) -> &str {
        "echo"
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        if self.path_pattern.is_match(&ctx.path) && ctx.end_of_stream() {
            return self.echo(ctx, b"");
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_request_body(
        &self,
        ctx: &mut RequestContext,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        if self.path_pattern.is_match(&ctx.path) {
            return self.echo(ctx, body);
        }
        ctx.continue_request();
        Ok(())
    }
}
