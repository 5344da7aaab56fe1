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
//! # Headers Module
//!
//! Decoding of the header lists Envoy sends on the headers and trailers
//! phases, and the value type used when staging header mutations.
//!
//! Envoy carries a header either as a UTF-8 `value` or as opaque
//! `raw_value` bytes. A decoded [`Headers`] keeps the two representations in
//! separate maps so a name is found in exactly one of them.

use crate::envoy::config::core::v3::HeaderMap;
use std::collections::HashMap;
use thiserror::Error;

/// Pseudo-headers and ids consumed by the request context; never part of
/// the general header mapping.
pub(crate) const CONTEXT_HEADERS: [&str; 5] =
    [":scheme", ":authority", ":method", ":path", "x-request-id"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header {name:?} sets both 'value' and 'raw_value'")]
    Malformed { name: String },
}

/// Semantic view of a wire header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    values: HashMap<String, Vec<String>>,
    raw_values: HashMap<String, Vec<u8>>,
}

impl Headers {
    /// Decodes a wire header list.
    ///
    /// Text values are split on `,` into an ordered list. Entries without a
    /// text value are kept as raw bytes, even when empty. A later entry for
    /// the same name replaces the earlier one.
    pub fn from_wire(header_map: Option<&HeaderMap>) -> Result<Self, HeaderError> {
        let mut headers = Headers::default();
        let Some(header_map) = header_map else {
            return Ok(headers);
        };

        for h in &header_map.headers {
            if !h.value.is_empty() && !h.raw_value.is_empty() {
                return Err(HeaderError::Malformed {
                    name: h.key.clone(),
                });
            }
            if CONTEXT_HEADERS.contains(&h.key.as_str()) {
                continue;
            }

            if !h.value.is_empty() {
                headers.raw_values.remove(&h.key);
                headers.values.insert(
                    h.key.clone(),
                    h.value.split(',').map(str::to_string).collect(),
                );
            } else {
                headers.values.remove(&h.key);
                headers.raw_values.insert(h.key.clone(), h.raw_value.clone());
            }
        }
        Ok(headers)
    }

    /// Text values for `name`, if it was sent as text.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Raw bytes for `name`, if it was sent as a raw value.
    pub fn get_raw(&self, name: &str) -> Option<&[u8]> {
        self.raw_values.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.raw_values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.raw_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.raw_values.is_empty()
    }

    pub fn values(&self) -> &HashMap<String, Vec<String>> {
        &self.values
    }

    pub fn raw_values(&self) -> &HashMap<String, Vec<u8>> {
        &self.raw_values
    }

    /// Text headers with their values joined back with `,`.
    pub fn joined(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(name, values)| (name.clone(), values.join(",")))
            .collect()
    }
}

/// A header value staged for mutation: either text or raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderValue {
    pub value: String,
    pub raw_value: Option<Vec<u8>>,
}

impl HeaderValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            raw_value: None,
        }
    }

    pub fn raw(raw_value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: String::new(),
            raw_value: Some(raw_value.into()),
        }
    }

    /// True when both representations are set.
    pub fn is_conflicting(&self) -> bool {
        !self.value.is_empty() && self.raw_value.is_some()
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoy::config::core::v3::HeaderValue as WireHeaderValue;

    fn text(key: &str, value: &str) -> WireHeaderValue {
        WireHeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        }
    }

    fn raw(key: &str, raw_value: &[u8]) -> WireHeaderValue {
        WireHeaderValue {
            key: key.to_string(),
            raw_value: raw_value.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_splits_text_values_on_commas() {
        let map = HeaderMap {
            headers: vec![text("accept", "text/html,application/json")],
        };
        let headers = Headers::from_wire(Some(&map)).unwrap();

        assert_eq!(
            headers.get("accept").unwrap(),
            &["text/html".to_string(), "application/json".to_string()]
        );
        assert!(headers.get_raw("accept").is_none());
    }

    #[test]
    fn test_keeps_raw_values_apart() {
        let map = HeaderMap {
            headers: vec![raw("x-bin", &[0xde, 0xad]), text("host", "example.com")],
        };
        let headers = Headers::from_wire(Some(&map)).unwrap();

        assert_eq!(headers.get_raw("x-bin").unwrap(), &[0xde, 0xad]);
        assert!(headers.get("x-bin").is_none());
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_rejects_entry_with_both_values() {
        let map = HeaderMap {
            headers: vec![WireHeaderValue {
                key: "x-both".to_string(),
                value: "a".to_string(),
                raw_value: b"b".to_vec(),
            }],
        };

        assert_eq!(
            Headers::from_wire(Some(&map)),
            Err(HeaderError::Malformed {
                name: "x-both".to_string()
            })
        );
    }

    #[test]
    fn test_empty_and_missing_lists() {
        assert!(Headers::from_wire(None).unwrap().is_empty());
        assert!(Headers::from_wire(Some(&HeaderMap::default()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_skips_context_headers() {
        let map = HeaderMap {
            headers: vec![
                text(":method", "GET"),
                text(":path", "/x"),
                text("x-request-id", "abc"),
                text("user-agent", "curl"),
            ],
        };
        let headers = Headers::from_wire(Some(&map)).unwrap();

        assert_eq!(headers.len(), 1);
        assert!(!headers.contains(":method"));
        assert!(headers.contains("user-agent"));
    }

    #[test]
    fn test_joined_restores_header_lines() {
        let map = HeaderMap {
            headers: vec![text("accept", "a,b")],
        };
        let joined = Headers::from_wire(Some(&map)).unwrap().joined();
        assert_eq!(joined.get("accept").map(String::as_str), Some("a,b"));
    }

    #[test]
    fn test_header_value_conflict() {
        assert!(!HeaderValue::text("a").is_conflicting());
        assert!(!HeaderValue::raw(b"a".to_vec()).is_conflicting());
        let both = HeaderValue {
            value: "a".to_string(),
            raw_value: Some(b"b".to_vec()),
        };
        assert!(both.is_conflicting());
    }
}
