// HTTP transport: one plain client for the official API, one
// browser-shaped client for the web interface

use crate::config::AppConfig;
use crate::error::{ProxyError, Result, TransientKind};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tokio::time::timeout;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Which upstream face a request should wear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Browser-emulating client with cookie jar, used for the web
    /// transport.
    Fingerprinted,
    /// Ordinary TLS, used for the OAuth API transport.
    Plain,
}

pub struct HttpTransport {
    plain: reqwest::Client,
    fingerprinted: Option<reqwest::Client>,
    read_timeout: Duration,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let proxy = if config.proxy_url.is_empty() {
            None
        } else {
            Some(reqwest::Proxy::all(&config.proxy_url).map_err(|e| {
                ProxyError::Internal(anyhow::anyhow!("invalid proxy url: {}", e))
            })?)
        };

        let mut plain_builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(proxy) = proxy.clone() {
            plain_builder = plain_builder.proxy(proxy);
        }
        let plain = plain_builder
            .build()
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("build plain client: {}", e)))?;

        let mut fp_builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .cookie_store(true)
            .default_headers(browser_headers())
            .gzip(true);
        if let Some(proxy) = proxy {
            fp_builder = fp_builder.proxy(proxy);
        }
        // The browser-shaped client can fail to construct on platforms
        // without the required TLS backend. The web transport is then
        // disabled for the whole process, never per-request.
        let fingerprinted = match fp_builder.build() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("browser client unavailable, web transport disabled: {}", e);
                None
            }
        };

        Ok(Self {
            plain,
            fingerprinted,
            read_timeout: config.read_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn web_enabled(&self) -> bool {
        self.fingerprinted.is_some()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn client(&self, kind: ClientKind) -> Result<&reqwest::Client> {
        match kind {
            ClientKind::Plain => Ok(&self.plain),
            ClientKind::Fingerprinted => self.fingerprinted.as_ref().ok_or_else(|| {
                ProxyError::UpstreamFatal("web transport disabled on this platform".to_string())
            }),
        }
    }

    /// Send a request, mapping connection-phase failures to the
    /// retryable taxonomy. Streaming responses keep the overall
    /// deadline unbounded; the per-read guard lives in `byte_stream`.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(classify_request_error)
    }

    /// Lazy byte-chunk sequence with a strict per-read deadline. The
    /// caller cancels by dropping the stream, which tears down the
    /// underlying connection.
    pub fn byte_stream(
        &self,
        response: reqwest::Response,
    ) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        let read_timeout = self.read_timeout;
        async_stream::stream! {
            let mut inner = response.bytes_stream();
            loop {
                match timeout(read_timeout, inner.next()).await {
                    Ok(Some(Ok(bytes))) => yield Ok(bytes),
                    Ok(Some(Err(e))) => {
                        yield Err(classify_body_error(e));
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        yield Err(ProxyError::UpstreamTransient(TransientKind::ReadTimeout));
                        return;
                    }
                }
            }
        }
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("user-agent", HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        "accept-language",
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers
}

fn classify_request_error(e: reqwest::Error) -> ProxyError {
    if e.is_connect() {
        ProxyError::UpstreamTransient(TransientKind::ConnectFailed)
    } else if e.is_timeout() {
        ProxyError::UpstreamTransient(TransientKind::ReadTimeout)
    } else if e.is_body() || e.is_decode() {
        ProxyError::UpstreamTransient(TransientKind::BodyError)
    } else {
        ProxyError::UpstreamFatal(e.to_string())
    }
}

fn classify_body_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTransient(TransientKind::ReadTimeout)
    } else {
        ProxyError::UpstreamTransient(TransientKind::BodyError)
    }
}

/// Map an upstream status code to the error taxonomy, for callers that
/// have already read the response head.
pub fn status_error(status: u16, body: &str) -> ProxyError {
    if status >= 500 {
        ProxyError::UpstreamTransient(TransientKind::Status5xx(status))
    } else {
        ProxyError::UpstreamFatal(format!("upstream status {}: {}", status, body))
    }
}
