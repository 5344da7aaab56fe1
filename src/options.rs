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
use serde::Deserialize;

/// What the session does when a processor callback returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackErrorPolicy {
    /// End the stream with a gRPC status mapped from the error.
    #[default]
    Abort,
    /// Log the error and let the transaction continue unchanged.
    Continue,
}

/// Per-processor switches read by the dispatcher and the session loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub log_stream: bool,
    pub log_phases: bool,
    pub update_extproc_header: bool,
    pub update_duration_header: bool,
    pub on_callback_error: CallbackErrorPolicy,
}

impl ProcessingOptions {
    /// Turns on every switch set in `other`; the error policy is kept.
    pub fn merge_flags(mut self, other: &ProcessingOptions) -> Self {
        self.log_stream |= other.log_stream;
        self.log_phases |= other.log_phases;
        self.update_extproc_header |= other.update_extproc_header;
        self.update_duration_header |= other.update_duration_header;
        self
    }
}
