//! The network side of a cached fetch.
//!
//! [`CachingFetch`](crate::fetch::CachingFetch) never talks to the network itself, it hands
//! every cache miss to a [`Transport`]. [`HttpTransport`] is the default implementation on top
//! of [`reqwest`].

use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use reqwest::{Method, Url, redirect};

use crate::body::ByteStream;
use crate::error::TransportError;
use crate::metadata::ResponseMeta;
use crate::request::{Request, RequestBody, RequestInit, Resource, TransportOptions, encode_form};

/// A response as it arrives from the network.
#[derive(Debug)]
pub struct TransportResponse {
    pub meta: ResponseMeta,
    pub body: ByteStream,
}

/// Performs the actual requests on cache misses.
pub trait Transport: Send + Sync + 'static {
    fn fetch(
        &self,
        resource: Resource,
        init: RequestInit,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

/// Timeouts for all requests made by an [`HttpTransport`].
#[derive(Copy, Clone, Debug)]
pub struct HttpTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request, unless overridden per request.
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and request timeouts.
/// * `follow` limits the number of redirects. Exceeding it fails the request.
/// * `compress` enables transparent decompression of response bodies.
pub fn create_client(
    timeouts: &HttpTimeouts,
    follow: Option<usize>,
    compress: bool,
) -> Result<reqwest::Client, TransportError> {
    let policy = match follow {
        Some(max) => redirect::Policy::limited(max),
        None => redirect::Policy::default(),
    };

    let client = reqwest::ClientBuilder::new()
        .gzip(compress)
        .brotli(compress)
        .deflate(compress)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(policy)
        .build()?;
    Ok(client)
}

/// A [`Transport`] that performs real HTTP requests.
///
/// Redirect limits and compression are client-wide settings in `reqwest`. Requests that ask
/// for anything else than the defaults are sent through a dedicated client.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeouts: HttpTimeouts,
}

impl HttpTransport {
    pub fn new(timeouts: HttpTimeouts) -> Result<Self, TransportError> {
        Ok(Self {
            client: create_client(&timeouts, None, true)?,
            timeouts,
        })
    }

    fn client_for(&self, options: &TransportOptions) -> Result<reqwest::Client, TransportError> {
        let compress = options.compress.unwrap_or(true);
        if options.follow.is_none() && compress {
            return Ok(self.client.clone());
        }
        create_client(&self.timeouts, options.follow, compress)
    }

    async fn send(
        &self,
        resource: Resource,
        init: RequestInit,
    ) -> Result<TransportResponse, TransportError> {
        let (request, options) = Request::from_parts(resource, init);
        let client = self.client_for(&options)?;

        let method = Method::from_bytes(request.method.as_bytes()).map_err(TransportError::new)?;
        let requested_url = Url::parse(&request.url).map_err(TransportError::new)?;
        let mut builder = client.request(method, requested_url.clone());

        let has_content_type = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(TransportError::new)?;
            let value = HeaderValue::from_str(value).map_err(TransportError::new)?;
            builder = builder.header(name, value);
        }

        let content_type = match request.body {
            RequestBody::Empty => None,
            RequestBody::Text(text) => {
                builder = builder.body(text);
                Some("text/plain;charset=UTF-8".to_owned())
            }
            RequestBody::Form(params) => {
                builder = builder.body(encode_form(&params));
                Some("application/x-www-form-urlencoded;charset=UTF-8".to_owned())
            }
            RequestBody::File(path) => {
                let stream = ByteStream::from_file(&path).await?;
                builder = builder.body(reqwest::Body::wrap_stream(stream));
                None
            }
            RequestBody::Multipart(form) => {
                builder = builder.body(form.to_bytes());
                Some(form.content_type())
            }
            RequestBody::Bytes(bytes) => {
                builder = builder.body(bytes);
                None
            }
            RequestBody::Stream(stream) => {
                builder = builder.body(reqwest::Body::wrap_stream(stream));
                None
            }
        };
        if let (Some(content_type), false) = (content_type, has_content_type) {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!(url = %requested_url, "sending request");
        let response = builder.send().await?;

        let status = response.status();
        let mut meta = ResponseMeta::new(
            response.url().as_str(),
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
        );
        for (name, value) in response.headers() {
            meta.append_header(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        meta.size = response.content_length();
        meta.timeout = options.timeout;
        // reqwest does not expose the number of hops
        meta.counter = u32::from(*response.url() != requested_url);

        if let (Some(max_size), Some(size)) = (options.max_size, meta.size) {
            if size > max_size {
                return Err(TransportError::new(format!(
                    "content size {size} exceeds the limit of {max_size} bytes"
                )));
            }
        }

        let mut stream = response.bytes_stream().map_err(io::Error::other).boxed();
        if let Some(max_size) = options.max_size {
            let mut received = 0u64;
            stream = stream
                .map(move |chunk| {
                    let chunk = chunk?;
                    received += chunk.len() as u64;
                    if received > max_size {
                        return Err(io::Error::other(format!(
                            "content size exceeds the limit of {max_size} bytes"
                        )));
                    }
                    Ok(chunk)
                })
                .boxed();
        }

        Ok(TransportResponse {
            meta,
            body: ByteStream::new(stream),
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        resource: Resource,
        init: RequestInit,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        Box::pin(self.send(resource, init))
    }
}
