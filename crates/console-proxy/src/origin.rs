use std::collections::HashMap;
use std::fmt;

use http::header::ORIGIN;
use http::HeaderMap;
use thiserror::Error;
use url::Url;

use crate::authority::ConsoleKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginRejection {
    #[error("no origin is configured for console kind '{kind}'")]
    UnknownConsoleKind { kind: ConsoleKind },
    #[error("blank Origin header")]
    Blank,
    #[error("malformed Origin header")]
    Malformed,
    #[error("origin scheme '{presented}' does not match expected '{expected}'")]
    SchemeMismatch { expected: String, presented: String },
    #[error("origin host '{presented}' does not match expected '{expected}'")]
    HostMismatch { expected: String, presented: String },
    #[error("origin port {presented} does not match expected {expected}")]
    PortMismatch { expected: u16, presented: u16 },
}

#[derive(Debug, Error)]
pub enum OriginConfigError {
    #[error("invalid base URL '{url}' for console kind '{kind}': {source}")]
    InvalidUrl {
        kind: ConsoleKind,
        url: String,
        source: url::ParseError,
    },
    #[error("base URL '{url}' for console kind '{kind}' has no host")]
    MissingHost { kind: ConsoleKind, url: String },
    #[error("base URL '{url}' for console kind '{kind}' has no port and its scheme has no default")]
    MissingPort { kind: ConsoleKind, url: String },
}

/// Scheme, host and port a browser origin must carry for one console kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginExpectation {
    scheme: String,
    host: String,
    port: u16,
}

impl OriginExpectation {
    /// Derive the expectation from the console's public base URL (for example
    /// `https://console.example.net:6080/vnc_auto.html`).
    ///
    /// `ws`/`wss` bases map to `http`/`https`: pages, not sockets, are what a
    /// browser reports as its origin. An omitted port means the scheme
    /// default.
    pub fn from_base_url(kind: &ConsoleKind, base_url: &str) -> Result<Self, OriginConfigError> {
        let url = Url::parse(base_url).map_err(|source| OriginConfigError::InvalidUrl {
            kind: kind.clone(),
            url: base_url.to_string(),
            source,
        })?;

        let scheme = match url.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        }
        .to_string();

        let host = url
            .host_str()
            .ok_or_else(|| OriginConfigError::MissingHost {
                kind: kind.clone(),
                url: base_url.to_string(),
            })?
            .to_string();

        let port = url
            .port()
            .or_else(|| default_port(&scheme))
            .ok_or_else(|| OriginConfigError::MissingPort {
                kind: kind.clone(),
                url: base_url.to_string(),
            })?;

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether a present, non-blank Origin value matches exactly.
    pub fn accepts(&self, presented: &str) -> bool {
        self.compare(presented).is_ok()
    }

    fn compare(&self, presented: &str) -> Result<(), OriginRejection> {
        let url = Url::parse(presented.trim()).map_err(|_| OriginRejection::Malformed)?;
        let host = url.host_str().ok_or(OriginRejection::Malformed)?;

        if url.scheme() != self.scheme {
            return Err(OriginRejection::SchemeMismatch {
                expected: self.scheme.clone(),
                presented: url.scheme().to_string(),
            });
        }
        if host != self.host {
            return Err(OriginRejection::HostMismatch {
                expected: self.host.clone(),
                presented: host.to_string(),
            });
        }

        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or(OriginRejection::Malformed)?;
        if port != self.port {
            return Err(OriginRejection::PortMismatch {
                expected: self.port,
                presented: port,
            });
        }

        Ok(())
    }
}

impl fmt::Display for OriginExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Per-console-kind origin expectations, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    expectations: HashMap<ConsoleKind, OriginExpectation>,
}

impl OriginPolicy {
    pub fn new(expectations: HashMap<ConsoleKind, OriginExpectation>) -> Self {
        Self { expectations }
    }

    /// Build a policy from `(kind, base URL)` pairs. A later pair for the same
    /// kind replaces an earlier one.
    pub fn from_base_urls<I, S>(entries: I) -> Result<Self, OriginConfigError>
    where
        I: IntoIterator<Item = (ConsoleKind, S)>,
        S: AsRef<str>,
    {
        let mut expectations = HashMap::new();
        for (kind, base_url) in entries {
            let expectation = OriginExpectation::from_base_url(&kind, base_url.as_ref())?;
            expectations.insert(kind, expectation);
        }
        Ok(Self { expectations })
    }

    pub fn expected_base(&self, kind: &ConsoleKind) -> Option<&OriginExpectation> {
        self.expectations.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ConsoleKind> {
        self.expectations.keys()
    }

    /// Validate the `Origin` header of an upgrade request for `kind`.
    ///
    /// Rule order matters: an unknown kind is rejected even without an
    /// Origin header, and an absent header is accepted.
    ///
    /// SECURITY: a request with no Origin is accepted so that non-browser
    /// clients can connect. Browsers always send Origin on WebSocket
    /// upgrades, so a cross-site browser upgrade still hits the exact match.
    pub fn check(&self, kind: &ConsoleKind, headers: &HeaderMap) -> Result<(), OriginRejection> {
        let expectation = self.expected_base(kind).ok_or_else(|| {
            OriginRejection::UnknownConsoleKind { kind: kind.clone() }
        })?;

        match presented_origin(headers)? {
            None => Ok(()),
            Some(origin) if origin.trim().is_empty() => Err(OriginRejection::Blank),
            Some(origin) => expectation.compare(origin),
        }
    }
}

/// The single `Origin` value of a request, if any. Several Origin headers,
/// or one that is not visible ASCII, are malformed.
fn presented_origin(headers: &HeaderMap) -> Result<Option<&str>, OriginRejection> {
    let mut values = headers.get_all(ORIGIN).iter();
    let Some(first) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(OriginRejection::Malformed);
    }
    first
        .to_str()
        .map(Some)
        .map_err(|_| OriginRejection::Malformed)
}
