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
//! # JSON Masker
//!
//! Replaces selected leaves of JSON bodies with `****`.
//!
//! A path is a dotted list of object keys or array indexes (`user.ssn`,
//! `cards.0.number`). A key that itself contains dots matches too, so
//! `mask.me` masks both `{"mask": {"me": 1}}` and `{"mask.me": 1}`. Only
//! bodies sent with `content-type: application/json` are inspected, and only
//! leaves are masked, never whole objects or arrays.

use crate::context::RequestContext;
use crate::headers::Headers;
use crate::processor::{ProcessingError, Processor};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

pub const MASK: &str = "****";

#[derive(Debug, Clone)]
pub struct MaskerProcessor {
    request_paths: Vec<String>,
    response_paths: Vec<String>,
}

impl Default for MaskerProcessor {
    fn default() -> Self {
        Self::new(vec!["maskme".to_string(), "mask.me".to_string()], Vec::new())
    }
}

/// Whether the response being processed declared a JSON body.
#[derive(Debug, Default)]
pub struct MaskerState {
    response_is_json: bool,
}

fn is_json(headers: &Headers) -> bool {
    headers
        .get("content-type")
        .is_some_and(|types| types.iter().any(|t| t == "application/json"))
}

/// Masks the leaf at `path` below `value`. Returns whether anything changed.
fn mask_path(value: &mut Value, path: &str) -> bool {
    match value {
        Value::Object(map) => {
            if let Some(leaf) = map.get_mut(path) {
                if !leaf.is_object() && !leaf.is_array() {
                    *leaf = Value::String(MASK.to_string());
                    return true;
                }
            }
            let mut masked = false;
            for (i, _) in path.match_indices('.') {
                if let Some(child) = map.get_mut(&path[..i]) {
                    masked |= mask_path(child, &path[i + 1..]);
                }
            }
            masked
        }
        Value::Array(items) => {
            let (index, rest) = match path.split_once('.') {
                Some((index, rest)) => (index, Some(rest)),
                None => (path, None),
            };
            let Some(item) = index.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                return false;
            };
            match rest {
                Some(rest) => mask_path(item, rest),
                None if !item.is_object() && !item.is_array() => {
                    *item = Value::String(MASK.to_string());
                    true
                }
                None => false,
            }
        }
        _ => false,
    }
}

/// Masks `paths` in a JSON object body.
///
/// # Returns
///
/// The re-serialized body, or `None` when nothing matched.
///
/// # Errors
///
/// When `body` is not valid JSON.
pub fn mask_json(paths: &[String], body: &[u8]) -> Result<Option<Vec<u8>>, serde_json::Error> {
    let mut value: Value = serde_json::from_slice(body)?;
    let mut masked = false;
    for path in paths {
        masked |= mask_path(&mut value, path);
    }
    if !masked {
        return Ok(None);
    }
    serde_json::to_vec(&value).map(Some)
}

impl MaskerProcessor {
    pub fn new(request_paths: Vec<String>, response_paths: Vec<String>) -> Self {
        Self {
            request_paths,
            response_paths,
        }
    }

    fn mask_body<D>(&self, ctx: &mut RequestContext<D>, paths: &[String], body: &[u8]) {
        match mask_json(paths, body) {
            Ok(Some(masked)) => ctx.replace_body(&masked),
            Ok(None) => debug!("Nothing to mask"),
            Err(e) => warn!("Cannot mask body that is not JSON: {}", e),
        }
    }
}

#[async_trait]
impl Processor for MaskerProcessor {
    type Data = MaskerState;

    fn name(&self) -> &str {
        "masker"
    }

    async fn process_request_body(
        &self,
        ctx: &mut RequestContext<MaskerState>,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        if !self.request_paths.is_empty() && is_json(&ctx.headers) {
            self.mask_body(ctx, &self.request_paths, body);
        }
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_headers(
        &self,
        ctx: &mut RequestContext<MaskerState>,
        headers: &Headers,
    ) -> Result<(), ProcessingError> {
        ctx.data_mut().response_is_json = is_json(headers);
        ctx.continue_request();
        Ok(())
    }

    async fn process_response_body(
        &self,
        ctx: &mut RequestContext<MaskerState>,
        body: &[u8],
    ) -> Result<(), ProcessingError> {
        if !self.response_paths.is_empty() && ctx.data().response_is_json {
            self.mask_body(ctx, &self.response_paths, body);
        }
        ctx.continue_request();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoy::config::core::v3::{HeaderMap, HeaderValue as WireHeaderValue};
    use crate::envoy::service::ext_proc::v3::body_mutation::Mutation;
    use crate::utils::mutations::CONTENT_LENGTH;
    use serde_json::json;

    fn paths(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn json_headers() -> Headers {
        Headers::from_wire(Some(&HeaderMap {
            headers: vec![WireHeaderValue {
                key: "content-type".to_string(),
                value: "application/json".to_string(),
                ..Default::default()
            }],
        }))
        .unwrap()
    }

    fn replaced_body<D>(ctx: &RequestContext<D>) -> Option<Value> {
        match ctx.response().body_mutation()?.mutation.as_ref()? {
            Mutation::Body(body) => serde_json::from_slice(body).ok(),
            Mutation::ClearBody(_) => None,
        }
    }

    #[test]
    fn test_mask_nested_and_dotted_keys() {
        let body = json!({"mask": {"me": "secret", "keep": 1}, "mask.me": 7, "maskme": "x"});
        let masked = mask_json(
            &paths(&["maskme", "mask.me"]),
            body.to_string().as_bytes(),
        )
        .unwrap()
        .unwrap();

        let masked: Value = serde_json::from_slice(&masked).unwrap();
        assert_eq!(
            masked,
            json!({"mask": {"me": MASK, "keep": 1}, "mask.me": MASK, "maskme": MASK})
        );
    }

    #[test]
    fn test_mask_array_index() {
        let body = json!({"cards": [{"number": "4111"}, {"number": "5500"}]});
        let masked = mask_json(&paths(&["cards.1.number"]), body.to_string().as_bytes())
            .unwrap()
            .unwrap();

        let masked: Value = serde_json::from_slice(&masked).unwrap();
        assert_eq!(masked["cards"][0]["number"], "4111");
        assert_eq!(masked["cards"][1]["number"], MASK);
    }

    #[test]
    fn test_containers_are_not_masked() {
        let body = json!({"maskme": {"a": 1}});
        assert_eq!(
            mask_json(&paths(&["maskme"]), body.to_string().as_bytes()).unwrap(),
            None
        );
    }

    #[test]
    fn test_invalid_json() {
        assert!(mask_json(&paths(&["maskme"]), b"not json").is_err());
    }

    #[tokio::test]
    async fn test_request_body_masked_with_content_length() {
        let mut ctx = RequestContext::new();
        ctx.headers = json_headers();
        let body = json!({"maskme": "secret"}).to_string();

        MaskerProcessor::default()
            .process_request_body(&mut ctx, body.as_bytes())
            .await
            .unwrap();

        assert_eq!(replaced_body(&ctx), Some(json!({"maskme": MASK})));
        let content_length = ctx
            .response()
            .header_mutation()
            .set_headers
            .iter()
            .filter_map(|option| option.header.as_ref())
            .find(|h| h.key == CONTENT_LENGTH)
            .unwrap();
        assert_eq!(
            content_length.raw_value,
            json!({"maskme": MASK}).to_string().len().to_string().into_bytes()
        );
    }

    #[tokio::test]
    async fn test_non_json_request_untouched() {
        let mut ctx = RequestContext::new();
        MaskerProcessor::default()
            .process_request_body(&mut ctx, br#"{"maskme": "secret"}"#)
            .await
            .unwrap();
        assert!(ctx.response().body_mutation().is_none());
    }

    #[tokio::test]
    async fn test_response_paths_follow_response_content_type() {
        let processor = MaskerProcessor::new(Vec::new(), paths(&["token"]));
        let mut ctx = RequestContext::new();

        processor
            .process_response_headers(&mut ctx, &json_headers())
            .await
            .unwrap();
        ctx.reset_phase();
        processor
            .process_response_body(&mut ctx, br#"{"token":"abc"}"#)
            .await
            .unwrap();

        assert_eq!(replaced_body(&ctx), Some(json!({"token": MASK})));
    }
}
