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
use crate::envoy::service::ext_proc::v3::{
    processing_request::Request as ProcessingRequestType, ProcessingRequest,
};
use std::fmt;

/// The stage of an HTTP transaction a `ProcessingRequest` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Undetermined,
    RequestHeaders,
    RequestBody,
    RequestTrailers,
    ResponseHeaders,
    ResponseBody,
    ResponseTrailers,
}

impl Phase {
    pub fn of(req: &ProcessingRequest) -> Self {
        match &req.request {
            Some(ProcessingRequestType::RequestHeaders(_)) => Phase::RequestHeaders,
            Some(ProcessingRequestType::RequestBody(_)) => Phase::RequestBody,
            Some(ProcessingRequestType::RequestTrailers(_)) => Phase::RequestTrailers,
            Some(ProcessingRequestType::ResponseHeaders(_)) => Phase::ResponseHeaders,
            Some(ProcessingRequestType::ResponseBody(_)) => Phase::ResponseBody,
            Some(ProcessingRequestType::ResponseTrailers(_)) => Phase::ResponseTrailers,
            None => Phase::Undetermined,
        }
    }

    /// Phases on which Envoy accepts an `ImmediateResponse`.
    pub fn allows_immediate_response(self) -> bool {
        matches!(
            self,
            Phase::RequestHeaders
                | Phase::RequestBody
                | Phase::ResponseHeaders
                | Phase::ResponseBody
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Undetermined => "undetermined",
            Phase::RequestHeaders => "request_headers",
            Phase::RequestBody => "request_body",
            Phase::RequestTrailers => "request_trailers",
            Phase::ResponseHeaders => "response_headers",
            Phase::ResponseBody => "response_body",
            Phase::ResponseTrailers => "response_trailers",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
