use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Everything besides the body that is needed to reconstruct a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// The final URL, after following redirects.
    pub url: String,
    pub status: u16,
    pub status_text: String,
    /// Response headers, keyed by lower-case name.
    pub headers: BTreeMap<String, Vec<String>>,
    /// The body size declared by the server, if any.
    #[serde(default)]
    pub size: Option<u64>,
    /// The timeout the request was made with.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// The number of redirects that were followed.
    #[serde(default)]
    pub counter: u32,
}

impl ResponseMeta {
    /// Creates metadata for a response without headers.
    pub fn new(url: impl Into<String>, status: u16, status_text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            status_text: status_text.into(),
            headers: BTreeMap::new(),
            size: None,
            timeout: None,
            counter: 0,
        }
    }

    /// Appends a header value, lower-casing the name.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Returns the first value of the header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Whether the status is in the `200..=299` range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn redirected(&self) -> bool {
        self.counter > 0
    }
}
