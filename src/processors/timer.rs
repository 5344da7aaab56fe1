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
//! Wall-clock timing of a whole transaction, as seen from the processor.
//!
//! The request is tagged with the time its headers arrived; the response
//! carries the start, the finish and the upstream duration, in nanoseconds.

use crate::context::RequestContext;
use crate::envoy::config::core::v3::header_value_option::HeaderAppendAction;
use crate::headers::Headers;
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

pub const STARTED_HEADER: &str = "x-extproc-started-ns";
pub const FINISHED_HEADER: &str = "x-extproc-finished-ns";
pub const UPSTREAM_DURATION_HEADER: &str = "x-upstream-duration-ns";

#[derive(Debug, Default, Clone)]
pub struct TimerProcessor;

fn unix_nanos(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

/// Stages the three timing headers with `action`.
fn stage_timing(ctx: &mut RequestContext, action: HeaderAppendAction) -> Result<(), ProcessingError> {
    let started = ctx.started_at();
    let finished = SystemTime::now();
    let duration = finished
        .duration_since(started)
        .unwrap_or_default()
        .as_nanos();

    ctx.update_headers(
        [
            (STARTED_HEADER, unix_nanos(started)),
            (FINISHED_HEADER, unix_nanos(finished)),
            (UPSTREAM_DURATION_HEADER, duration.to_string()),
        ],
        action,
    )?;
    Ok(())
}

#[async_trait]
impl Processor for TimerProcessor {
    type Data = ();

    fn name(&self) -> &str {
        "timer"
    }

    async fn process_request_headers(
        &self,
        ctx: &mut RequestContext,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        let started = unix_nanos(ctx.started_at());
        ctx.overwrite_header(STARTED_HEADER, started)?;
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext,
        _headers: &Headers,
    ) -> Result<(), ProcessingError> {
        stage_timing(ctx, HeaderAppendAction::AddIfAbsent)?;
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_body(
        &self,
        ctx: &mut RequestContext,
        _body: &[u8],
    ) -> Result<(), ProcessingError> {
        stage_timing(ctx, HeaderAppendAction::OverwriteIfExistsOrAdd)?;
        ctx.continue_request();
        Ok(())
    }
}
