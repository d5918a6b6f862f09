//! The request side of a fetch: resources, call-site options and request bodies.

use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::body::ByteStream;

/// A list of `(name, value)` header pairs, in the order they were added.
///
/// Names are matched case-insensitively everywhere.
pub type Headers = Vec<(String, String)>;

/// The thing being fetched: either a bare URL or a fully structured [`Request`].
#[derive(Debug)]
pub enum Resource {
    Url(String),
    Request(Request),
}

impl Resource {
    /// The URL this resource points to.
    pub fn url(&self) -> &str {
        match self {
            Resource::Url(url) => url,
            Resource::Request(request) => &request.url,
        }
    }
}

impl From<&str> for Resource {
    fn from(url: &str) -> Self {
        Resource::Url(url.to_owned())
    }
}

impl From<String> for Resource {
    fn from(url: String) -> Self {
        Resource::Url(url)
    }
}

impl From<Url> for Resource {
    fn from(url: Url) -> Self {
        Resource::Url(url.into())
    }
}

impl From<Request> for Resource {
    fn from(request: Request) -> Self {
        Resource::Request(request)
    }
}

/// A structured request, carrying everything that may identify a response.
#[derive(Debug)]
pub struct Request {
    pub url: String,
    pub method: String,
    pub headers: Headers,
    pub body: RequestBody,
    pub integrity: String,
    pub cache: String,
    pub credentials: String,
    pub destination: String,
    pub redirect: String,
    pub referrer: String,
    pub referrer_policy: String,
}

impl Request {
    /// Creates a `GET` request with the default fetch modes.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".into(),
            headers: Headers::new(),
            body: RequestBody::Empty,
            integrity: String::new(),
            cache: "default".into(),
            credentials: "same-origin".into(),
            destination: String::new(),
            redirect: "follow".into(),
            referrer: "about:client".into(),
            referrer_policy: String::new(),
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Merges a [`Resource`] with call-site [`RequestInit`] options into the request that
    /// should actually be sent.
    ///
    /// Options given in `init` take precedence over the ones of a structured resource.
    /// Headers are replaced as a whole, not merged by name.
    pub fn from_parts(resource: Resource, init: RequestInit) -> (Request, TransportOptions) {
        let mut request = match resource {
            Resource::Url(url) => Request::new(url),
            Resource::Request(request) => request,
        };

        let RequestInit {
            method,
            headers,
            body,
            integrity,
            cache,
            credentials,
            destination,
            redirect,
            referrer,
            referrer_policy,
            transport,
        } = init;

        if let Some(method) = method {
            request.method = method;
        }
        if let Some(headers) = headers {
            request.headers = headers;
        }
        if let Some(body) = body {
            request.body = body;
        }
        let overrides = [
            (&mut request.integrity, integrity),
            (&mut request.cache, cache),
            (&mut request.credentials, credentials),
            (&mut request.destination, destination),
            (&mut request.redirect, redirect),
            (&mut request.referrer, referrer),
            (&mut request.referrer_policy, referrer_policy),
        ];
        for (field, value) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }

        (request, transport)
    }
}

/// Call-site options of a single fetch, each overriding the resource when present.
#[derive(Debug, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<RequestBody>,
    pub integrity: Option<String>,
    pub cache: Option<String>,
    pub credentials: Option<String>,
    pub destination: Option<String>,
    pub redirect: Option<String>,
    pub referrer: Option<String>,
    pub referrer_policy: Option<String>,
    /// Delivery options which never influence the cache key.
    pub transport: TransportOptions,
}

impl RequestInit {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Options that affect how a request is delivered, but not which response it identifies.
///
/// These are excluded from cache key derivation on every code path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Overall timeout for the request, including reading the body.
    pub timeout: Option<Duration>,
    /// Maximum accepted response body size in bytes.
    pub max_size: Option<u64>,
    /// Maximum number of redirects to follow.
    pub follow: Option<usize>,
    /// Whether to transparently decompress response bodies.
    pub compress: Option<bool>,
}

/// The body of a request.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Text(String),
    /// URL-encoded form parameters, in insertion order.
    Form(Vec<(String, String)>),
    /// A body streamed from a file, identified by its path.
    File(PathBuf),
    Multipart(MultipartForm),
    Bytes(Bytes),
    /// An opaque stream, which can be sent but can not be used as part of a cache key.
    Stream(ByteStream),
}

impl RequestBody {
    /// A short name of the body shape, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::Empty => "empty",
            RequestBody::Text(_) => "text",
            RequestBody::Form(_) => "form",
            RequestBody::File(_) => "file",
            RequestBody::Multipart(_) => "multipart",
            RequestBody::Bytes(_) => "bytes",
            RequestBody::Stream(_) => "stream",
        }
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Text(s)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Text(s.to_owned())
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(bytes.into())
    }
}

impl From<MultipartForm> for RequestBody {
    fn from(form: MultipartForm) -> Self {
        RequestBody::Multipart(form)
    }
}

impl From<ByteStream> for RequestBody {
    fn from(stream: ByteStream) -> Self {
        RequestBody::Stream(stream)
    }
}

/// A `multipart/form-data` body.
///
/// Every form gets a random boundary on construction, so two forms with identical fields
/// still render to different bytes.
#[derive(Debug, Clone)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone)]
struct MultipartPart {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::with_boundary(format!(
            "------------------------{:032x}",
            rand::random::<u128>()
        ))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    /// Adds a plain text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    /// Adds a file field.
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The `Content-Type` header value matching this form.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Renders the complete body, including the closing delimiter.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for part in &self.parts {
            let mut head = format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
                self.boundary, part.name
            );
            if let Some(filename) = &part.filename {
                write!(head, "; filename=\"{filename}\"").unwrap();
            }
            head.push_str("\r\n");
            if let Some(content_type) = &part.content_type {
                write!(head, "Content-Type: {content_type}\r\n").unwrap();
            }
            head.push_str("\r\n");

            buf.extend_from_slice(head.as_bytes());
            buf.extend_from_slice(&part.data);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        buf.freeze()
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes form parameters into their canonical `application/x-www-form-urlencoded` form.
pub fn encode_form(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

/// Returns `true` if the headers carry a `Cache-Control` directive named `directive`.
pub(crate) fn has_cache_directive(headers: &[(String, String)], directive: &str) -> bool {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("cache-control"))
        .flat_map(|(_, value)| value.split(','))
        .any(|d| d.trim().eq_ignore_ascii_case(directive))
}

/// Checks whether a fetch is restricted to answers from the cache.
///
/// The `only-if-cached` directive can come from either the call-site headers or the headers
/// of a structured request.
pub fn is_only_if_cached(resource: &Resource, init: &RequestInit) -> bool {
    cache_directive(resource, init, "only-if-cached")
}

/// Checks whether a fetch must neither be served from nor written to the cache.
pub fn is_no_store(resource: &Resource, init: &RequestInit) -> bool {
    cache_directive(resource, init, "no-store")
}

fn cache_directive(resource: &Resource, init: &RequestInit, directive: &str) -> bool {
    let in_init = init
        .headers
        .as_deref()
        .is_some_and(|headers| has_cache_directive(headers, directive));
    let in_resource = match resource {
        Resource::Request(request) => has_cache_directive(&request.headers, directive),
        Resource::Url(_) => false,
    };
    in_init || in_resource
}
