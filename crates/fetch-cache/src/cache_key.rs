use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FetchError;
use crate::request::{Headers, Request, RequestBody, RequestInit, Resource, encode_form};

/// The current cache format version.
///
/// It is part of every key, so bumping it invalidates all previously stored entries.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// A stable fingerprint of a request.
///
/// The key is the SHA-256 hash of a human-readable description of all the request fields that
/// participate in caching. That description is kept around as [`metadata`](Self::metadata)
/// to help debugging.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
    hex: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The key as 64 lowercase hex characters.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Create a [`CacheKeyBuilder`] for the given format version.
    pub fn builder(version: u32) -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: format!("version: {version}\n"),
        }
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes a single `name: value` line, with the value serialized as JSON.
    ///
    /// A missing value is written as `null`.
    pub fn write_field<T: Serialize + ?Sized>(
        &mut self,
        name: &str,
        value: Option<&T>,
    ) -> Result<(), fmt::Error> {
        let value = match value {
            Some(value) => serde_json::to_string(value).map_err(|_| fmt::Error)?,
            None => "null".into(),
        };
        writeln!(self.metadata, "{name}: {value}")
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        CacheKey {
            metadata: self.metadata.into(),
            hex: hex::encode(hash).into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Controls which headers take part in key derivation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderFlags {
    /// Include or exclude the whole header block.
    All(bool),
    /// Include all headers, except the ones explicitly mapped to `false`.
    Select(BTreeMap<String, bool>),
}

impl HeaderFlags {
    fn includes(&self, name: &str) -> bool {
        match self {
            HeaderFlags::All(all) => *all,
            HeaderFlags::Select(map) => !map
                .iter()
                .any(|(excluded, included)| !included && excluded.eq_ignore_ascii_case(name)),
        }
    }

    fn is_enabled(&self) -> bool {
        !matches!(self, HeaderFlags::All(false))
    }
}

impl Default for HeaderFlags {
    fn default() -> Self {
        HeaderFlags::All(true)
    }
}

/// Selects the request fields that participate in cache key derivation.
///
/// Fields that are turned off are still written to the key metadata, but as an empty
/// placeholder, so their values can not influence the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFlags {
    pub method: bool,
    pub url: bool,
    pub headers: HeaderFlags,
    pub body: bool,
    pub integrity: bool,
    pub cache: bool,
    pub credentials: bool,
    pub destination: bool,
    pub redirect: bool,
    pub referrer: bool,
    pub referrer_policy: bool,
}

impl Default for KeyFlags {
    fn default() -> Self {
        Self {
            method: true,
            url: true,
            headers: HeaderFlags::default(),
            body: true,
            integrity: true,
            cache: true,
            credentials: true,
            destination: true,
            redirect: true,
            referrer: true,
            referrer_policy: true,
        }
    }
}

/// Identity-relevant view of a request body.
#[derive(Serialize)]
#[serde(untagged)]
enum BodyKey {
    Text(String),
    File { file: String },
}

/// The fields of one side (resource or init) of a fetch, before flags are applied.
#[derive(Default)]
struct KeyFields<'a> {
    method: Option<&'a str>,
    url: Option<&'a str>,
    headers: Option<&'a Headers>,
    body: Option<&'a RequestBody>,
    integrity: Option<&'a str>,
    cache: Option<&'a str>,
    credentials: Option<&'a str>,
    destination: Option<&'a str>,
    redirect: Option<&'a str>,
    referrer: Option<&'a str>,
    referrer_policy: Option<&'a str>,
}

impl<'a> KeyFields<'a> {
    fn from_request(request: &'a Request) -> Self {
        Self {
            method: Some(&request.method),
            url: Some(&request.url),
            headers: Some(&request.headers),
            body: Some(&request.body),
            integrity: Some(&request.integrity),
            cache: Some(&request.cache),
            credentials: Some(&request.credentials),
            destination: Some(&request.destination),
            redirect: Some(&request.redirect),
            referrer: Some(&request.referrer),
            referrer_policy: Some(&request.referrer_policy),
        }
    }

    fn from_init(init: &'a RequestInit) -> Self {
        // `init.transport` only affects delivery and is never part of the key.
        Self {
            method: init.method.as_deref(),
            url: None,
            headers: init.headers.as_ref(),
            body: init.body.as_ref(),
            integrity: init.integrity.as_deref(),
            cache: init.cache.as_deref(),
            credentials: init.credentials.as_deref(),
            destination: init.destination.as_deref(),
            redirect: init.redirect.as_deref(),
            referrer: init.referrer.as_deref(),
            referrer_policy: init.referrer_policy.as_deref(),
        }
    }

    fn write(
        &self,
        builder: &mut CacheKeyBuilder,
        prefix: &str,
        flags: &KeyFlags,
    ) -> Result<(), FetchError> {
        let strings = [
            ("method", flags.method, self.method),
            ("url", flags.url, self.url),
            ("integrity", flags.integrity, self.integrity),
            ("cache", flags.cache, self.cache),
            ("credentials", flags.credentials, self.credentials),
            ("destination", flags.destination, self.destination),
            ("redirect", flags.redirect, self.redirect),
            ("referrer", flags.referrer, self.referrer),
            ("referrer_policy", flags.referrer_policy, self.referrer_policy),
        ];
        for (name, enabled, value) in strings {
            let value = value.filter(|_| enabled);
            builder
                .write_field(&format!("{prefix}.{name}"), value)
                .unwrap();
        }

        let headers = self
            .headers
            .filter(|_| flags.headers.is_enabled())
            .map(|headers| normalize_headers(headers, &flags.headers));
        builder
            .write_field(&format!("{prefix}.headers"), headers.as_ref())
            .unwrap();

        let body = match self.body.filter(|_| flags.body) {
            Some(body) => normalize_body(body)?,
            None => None,
        };
        // NOTE: plain strings and string maps always serialize, so writing can not fail.
        builder
            .write_field(&format!("{prefix}.body"), body.as_ref())
            .unwrap();

        Ok(())
    }
}

/// Lower-cases header names, drops excluded headers and the `only-if-cached` directive.
///
/// Repeated headers are joined with `, ` in the order they appeared.
fn normalize_headers(headers: &Headers, flags: &HeaderFlags) -> BTreeMap<String, String> {
    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if !flags.includes(&name) {
            continue;
        }

        let value = if name == "cache-control" {
            let directives: Vec<_> = value
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("only-if-cached"))
                .collect();
            if directives.is_empty() {
                continue;
            }
            directives.join(", ")
        } else {
            value.clone()
        };

        normalized
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    normalized
}

/// Reduces a request body to the parts that identify it.
fn normalize_body(body: &RequestBody) -> Result<Option<BodyKey>, FetchError> {
    let key = match body {
        RequestBody::Empty => return Ok(None),
        RequestBody::Text(text) => BodyKey::Text(text.clone()),
        RequestBody::Form(params) => BodyKey::Text(encode_form(params)),
        RequestBody::File(path) => BodyKey::File {
            file: path.to_string_lossy().into_owned(),
        },
        RequestBody::Multipart(form) => {
            let rendered = form.to_bytes();
            let rendered = String::from_utf8_lossy(&rendered);
            BodyKey::Text(rendered.replace(form.boundary(), ""))
        }
        RequestBody::Bytes(bytes) => BodyKey::Text(String::from_utf8_lossy(bytes).into_owned()),
        RequestBody::Stream(_) => {
            return Err(FetchError::UnsupportedBodyType(body.kind().into()));
        }
    };
    Ok(Some(key))
}

/// Derives the [`CacheKey`] of a fetch.
///
/// The resource and the call-site options are written as two separate sections, followed by
/// nothing else: transport options are never part of the key.
pub fn derive_key(
    resource: &Resource,
    init: &RequestInit,
    flags: &KeyFlags,
    version: u32,
) -> Result<CacheKey, FetchError> {
    let mut builder = CacheKey::builder(version);

    let resource_fields = match resource {
        Resource::Url(url) => KeyFields {
            url: Some(url),
            ..Default::default()
        },
        Resource::Request(request) => KeyFields::from_request(request),
    };
    resource_fields.write(&mut builder, "resource", flags)?;
    KeyFields::from_init(init).write(&mut builder, "init", flags)?;

    Ok(builder.build())
}
