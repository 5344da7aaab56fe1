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
//! # Request Digest
//!
//! Computes a SHA-256 digest of each request and reports it on the request
//! and on the response.
//!
//! ## Digest input
//!
//! `METHOD:path` followed, for every body chunk, by `:` and the chunk. The
//! digest is final on the message that carries end-of-stream, either the
//! request headers (no body) or the last body chunk.

use crate::context::RequestContext;
use crate::headers::Headers;
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub const DIGEST_HEADER: &str = "x-extproc-request-digest";

/// Running digest of one request, kept in the context between phases.
#[derive(Debug, Clone, Default)]
pub struct RequestDigest {
    hasher: Sha256,
    digest: Option<String>,
}

impl RequestDigest {
    /// Starts a new digest for `method:path`.
    pub fn start(&mut self, method: &str, path: &str) {
        self.hasher = Sha256::new();
        self.hasher.update(method.as_bytes());
        self.hasher.update(b":");
        self.hasher.update(path.as_bytes());
        self.digest = None;
    }

    pub fn update_body(&mut self, chunk: &[u8]) {
        self.hasher.update(b":");
        self.hasher.update(chunk);
    }

    /// Finalizes the digest as lowercase hex.
    pub fn finish(&mut self) -> &str {
        let hasher = std::mem::take(&mut self.hasher);
        self.digest.insert(hex::encode(hasher.finalize()))
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

/// Adds the request digest to the request and the response.
#[derive(Debug, Default, Clone)]
pub struct DigestProcessor;

fn stage_digest(ctx: &mut RequestContext<RequestDigest>) -> Result<(), ProcessingError> {
    if let Some(digest) = ctx.data().digest().map(str::to_string) {
        ctx.add_header(DIGEST_HEADER, digest)?;
    }
    Ok(())
}

#[async_trait]
impl Processor for DigestProcessor {
    type Data = RequestDigest;

    fn name(&self) -> &str {
        "digest"
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext<RequestDigest>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        let (method, path) = (ctx.method.clone(), ctx.path.clone());
        ctx.data_mut().start(&method, &path);
        if ctx.end_of_stream() {
            ctx.data_mut().finish();
            stage_digest(ctx)?;
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_request_body(
        &self,
        ctx: &mut RequestContext<RequestDigest>,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        ctx.data_mut().update_body(body);
        if ctx.end_of_stream() {
            ctx.data_mut().finish();
            stage_digest(ctx)?;
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext<RequestDigest>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        if ctx.end_of_stream() {
            stage_digest(ctx)?;
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_body(
        &self,
        ctx: &mut RequestContext<RequestDigest>,
        _body: &[u8],
    ) -> Result<(), ProcessingError> {
        if ctx.end_of_stream() {
            stage_digest(ctx)?;
        }
        ctx.continue_request();
        Ok(())
    }
}
