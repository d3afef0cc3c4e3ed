//! Fetch event, request, and response vocabulary for the interception layer.

use appcache_store::{now_ms, CachedResponse};
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

/// Header set on every shim-originated fetch so the installed worker lets it
/// pass through untouched. Without it the installer's own pre-caching
/// fetches would re-enter the rule engine.
pub const USE_FETCH_HEADER: &str = "x-use-fetch";

/// Request mode, mirroring the interception platform's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    SameOrigin,
    #[default]
    NoCors,
    Cors,
    /// A top-level document load.
    Navigate,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// Redirect handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow redirects automatically.
    #[default]
    Follow,
    /// Don't follow redirects, return the redirect response.
    Manual,
    /// Error on redirect.
    Error,
}

/// An intercepted (or shim-originated) request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub credentials: CredentialsMode,
    pub redirect: RedirectMode,
    /// Empty referrer is represented as `None`.
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a plain GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            credentials: CredentialsMode::default(),
            redirect: RedirectMode::default(),
            referrer: None,
        }
    }

    /// Create a navigation request (top-level document load).
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// The GET used for every shim-originated fetch: credentials included,
    /// manual redirects, suppressed referrer, no-cors, and the pass-through
    /// header so an installed worker does not re-enter resolution.
    pub fn direct_get(url: &Url) -> Self {
        Self {
            credentials: CredentialsMode::Include,
            redirect: RedirectMode::Manual,
            ..Self::get(url.clone())
        }
        .header(
            HeaderName::from_static(USE_FETCH_HEADER),
            HeaderValue::from_static("true"),
        )
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the pass-through header is present: such requests must reach
    /// the network exactly as issued.
    pub fn passes_through(&self) -> bool {
        self.headers
            .get(USE_FETCH_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}

/// Response classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    #[default]
    Default,
    /// The opaque network-error object, status 0.
    Error,
}

/// A response, either live from the network or rebuilt from a cache entry.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub kind: ResponseKind,
    /// Whether this response was served from a per-version cache.
    pub from_cache: bool,
}

impl Response {
    /// Create a response with the given status and empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            kind: ResponseKind::Default,
            from_cache: false,
        }
    }

    /// Create a response with a body.
    pub fn with_body(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::new(status)
        }
    }

    /// The network-error object: returned only when CACHE, FALLBACK, and
    /// NETWORK all fail to match.
    pub fn error() -> Self {
        Self {
            kind: ResponseKind::Error,
            ..Self::new(0)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether this is the network-error object.
    pub fn is_network_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// Whether `Cache-Control` carries the `no-store` directive. Directives
    /// are tokenized, so `no-store-foo` does not match.
    pub fn has_no_store_directive(&self) -> bool {
        let Some(value) = self
            .headers
            .get(http::header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
        else {
            return false;
        };
        value.split(',').any(|directive| {
            directive
                .split('=')
                .next()
                .is_some_and(|name| name.trim().eq_ignore_ascii_case("no-store"))
        })
    }

    /// The body decoded as (lossy) UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Rebuild a response from a stored cache entry.
    pub fn from_cached(entry: CachedResponse) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &entry.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, value);
            }
        }
        Self {
            status: entry.status,
            headers,
            body: Bytes::from(entry.body),
            kind: ResponseKind::Default,
            from_cache: true,
        }
    }

    /// Convert into the stored form, keyed by `url`.
    pub fn to_cached(&self, url: &str) -> CachedResponse {
        let mut headers = HashMap::new();
        for (name, value) in &self.headers {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        CachedResponse {
            url: url.to_string(),
            status: self.status,
            headers,
            body: self.body.to_vec(),
            cached_at: now_ms(),
        }
    }
}

/// An intercepted fetch, as delivered to the worker agent.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    /// Opaque, platform-assigned id of the client the fetch originated from.
    pub client_id: Option<String>,
}

impl FetchEvent {
    /// Create an event with no client id.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    /// Attach the originating client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}
