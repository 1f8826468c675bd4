// ABOUTME: Request header argument parsing and response header aggregation
//
// Request headers arrive as "name:value" strings. Response headers are folded
// into a single-valued map, except `Set-Cookie`, which HTTP allows to repeat
// and which is therefore collected into an ordered list.

use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// Canonical name under which aggregated cookies are surfaced
pub const SET_COOKIE: &str = "Set-Cookie";

/// Rejected request header argument
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// No `:` separator
    #[error("Malformed header '{0}': expected name:value")]
    MissingColon(String),

    /// Nothing before the separator
    #[error("Malformed header '{0}': empty name")]
    EmptyName(String),

    /// Nothing after the separator
    #[error("Malformed header '{0}': empty value")]
    EmptyValue(String),
}

/// One request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Header name, surrounding whitespace removed
    pub name: String,
    /// Header value, surrounding whitespace removed
    pub value: String,
}

impl RequestHeader {
    /// Parse a `"name:value"` argument
    ///
    /// Splits on the first colon, so values may themselves contain colons
    /// (`Host:example.com:8443`).
    pub fn parse(raw: &str) -> Result<Self, HeaderError> {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| HeaderError::MissingColon(raw.to_string()))?;
        let name = name.trim();
        let value = value.trim();

        if name.is_empty() {
            return Err(HeaderError::EmptyName(raw.to_string()));
        }
        if value.is_empty() {
            return Err(HeaderError::EmptyValue(raw.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

/// Parse every header argument, failing on the first malformed one
pub fn parse_request_headers<S: AsRef<str>>(raw: &[S]) -> Result<Vec<RequestHeader>, HeaderError> {
    raw.iter().map(|h| RequestHeader::parse(h.as_ref())).collect()
}

/// Response headers as surfaced to callers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    fields: BTreeMap<String, String>,
    set_cookie: Vec<String>,
}

impl ResponseHeaders {
    /// Empty header set
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold headers in arrival order
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.push(name, value);
        }
        headers
    }

    /// Add one header
    ///
    /// `set-cookie` (any case) is appended to the cookie list; any other name
    /// overwrites an earlier value with the same name in any case, keeping the
    /// latest spelling.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if name.eq_ignore_ascii_case(SET_COOKIE) {
            self.set_cookie.push(value.into());
        } else {
            self.fields.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
            self.fields.insert(name, value.into());
        }
    }

    /// Single-valued header, matched case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Cookies in arrival order
    pub fn set_cookies(&self) -> &[String] {
        &self.set_cookie
    }

    /// Single-valued headers
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of distinct header names (cookies count once)
    pub fn len(&self) -> usize {
        self.fields.len() + usize::from(!self.set_cookie.is_empty())
    }

    /// True when no header was received
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.set_cookie.is_empty()
    }
}

impl Serialize for ResponseHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        if !self.set_cookie.is_empty() {
            map.serialize_entry(SET_COOKIE, &self.set_cookie)?;
        }
        map.end()
    }
}
