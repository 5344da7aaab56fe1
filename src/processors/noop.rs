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
use crate::options::ProcessingOptions;
use crate::processor::Processor;
use async_trait::async_trait;

/// Continues every phase unchanged. Only the provenance and duration headers
/// are added, so it measures the cost of the round trip itself.
#[derive(Debug, Default, Clone)]
pub struct NoopProcessor;

#[async_trait]
impl Processor for NoopProcessor {
    type Data = ();

    fn name(&self) -> &str {
        "noop"
    }

    fn options(&self) -> ProcessingOptions {
        ProcessingOptions {
            update_extproc_header: true,
            update_duration_header: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::headers::Headers;
    use crate::utils::mutations::StagedReply;

    #[tokio::test]
    async fn test_every_phase_continues() {
        let processor = NoopProcessor;
        let mut ctx = RequestContext::new();
        let headers = Headers::default();

        processor
            .process_request_headers(&mut ctx, &headers)
            .await
            .unwrap();
        assert_eq!(ctx.response().staged_reply(), &StagedReply::Continue);

        processor
            .process_response_body(&mut ctx, b"body")
            .await
            .unwrap();
        assert!(ctx.response().header_mutation().set_headers.is_empty());
        assert!(ctx.response().body_mutation().is_none());
    }

    #[test]
    fn test_options() {
        let options = NoopProcessor.options();
        assert!(options.update_extproc_header);
        assert!(options.update_duration_header);
        assert!(!options.log_phases);
    }
}
