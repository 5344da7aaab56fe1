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
//! # Envoy External Processing SDK
//!
//! Implement [`processor::Processor`] with the phases you care about, hand
//! it to a [`server::CalloutServer`], and the SDK takes care of the
//! `envoy.service.ext_proc.v3` stream: one [`context::RequestContext`] per
//! HTTP transaction, one reply per phase, and the reply shape Envoy expects
//! for each phase.

mod gen;

pub use gen::{envoy, grpc};

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod headers;
pub mod health;
pub mod options;
pub mod phase;
pub mod processor;
pub mod processors;
pub mod server;
pub mod service;
pub mod utils;
