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
use crate::context::{ContextError, RequestContext};
use crate::headers::Headers;
use crate::options::ProcessingOptions;
use crate::utils::mutations::MutationError;
use async_trait::async_trait;
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Processing failed: {0}")]
    Failed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<MutationError> for ProcessingError {
    fn from(err: MutationError) -> Self {
        ProcessingError::InvalidArgument(err.to_string())
    }
}

impl From<ContextError> for ProcessingError {
    fn from(err: ContextError) -> Self {
        ProcessingError::Failed(err.to_string())
    }
}

impl From<ProcessingError> for Status {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::PermissionDenied(msg) => Status::permission_denied(msg),
            ProcessingError::InvalidArgument(msg) => Status::invalid_argument(msg),
            ProcessingError::Failed(msg) => Status::internal(msg),
        }
    }
}

/// Callbacks invoked for each phase of an HTTP transaction.
///
/// One value is bound per server and shared by every stream, so anything it
/// keeps across streams must be `Sync`. Per-transaction state belongs in
/// [`Processor::Data`] or in the context's value map.
///
/// Every phase method defaults to continuing the transaction unchanged.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Typed scratch data, reset on every request headers phase.
    type Data: Default + Send + 'static;

    /// Name reported in the `x-extproc-names` header.
    fn name(&self) -> &str;

    fn options(&self) -> ProcessingOptions {
        ProcessingOptions::default()
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext<Self::Data>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.continue_request();
        Ok(())
    }

    async fn process_request_body(
        &self,
        ctx: &mut RequestContext<Self::Data>,
        _body: &[u8],
    ) -> Result<(), ProcessingError> {
        ctx.continue_request();
        Ok(())
    }

    async fn process_request_trailers(
        &self,
        ctx: &mut RequestContext<Self::Data>,
        _trailers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext<Self::Data>,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_body(
        &self,
        ctx: &mut RequestContext<Self::Data>,
        _body: &[u8],
    ) -> Result<(), ProcessingError> {
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_trailers(
        &self,
        ctx: &mut RequestContext<Self::Data>,
        _trailers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.continue_request();
        Ok(())
    }
}
