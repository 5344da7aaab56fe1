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
use crate::options::ProcessingOptions;
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;
use uuid::Uuid;

pub const CUSTOM_ID_KEY: &str = "customId";
pub const CUSTOM_DATA_HEADER: &str = "x-extproc-custom-data";

/// Passes a value from the request phase to the response phase through the
/// context's value map: a fresh UUID per request, echoed on the response.
#[derive(Debug, Default, Clone)]
pub struct DataProcessor;

#[async_trait]
impl Processor for DataProcessor {
    type Data = ();

    fn name(&self) -> &str {
        "data"
    }

    fn options(&self) -> ProcessingOptions {
        ProcessingOptions {
            update_extproc_header: true,
            update_duration_header: true,
            ..Default::default()
        }
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.set_value(CUSTOM_ID_KEY, Uuid::new_v4().to_string());
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        let id = ctx
            .get_value(CUSTOM_ID_KEY)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        ctx.add_header(CUSTOM_DATA_HEADER, id)?;
        ctx.continue_request();
        Ok(())
    }
}
