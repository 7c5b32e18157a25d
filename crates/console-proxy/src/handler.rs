use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::header::ORIGIN;
use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::authority::{AuthorityError, ConsoleKind, SessionAuthority, SessionDescriptor};
use crate::bridge::{BackendConnector, BoxedBackend};
use crate::origin::{OriginPolicy, OriginRejection};
use crate::token::{extract_token, ConnectionToken};

/// Progress of one connection attempt. States only move forward; `Rejected`
/// is terminal and reachable from any state before `Bridging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerState {
    Start,
    TokenExtracted,
    Authenticated,
    OriginChecked,
    Bridging,
    Closed,
    Rejected,
}

impl HandlerState {
    pub(crate) fn advance(self, next: HandlerState) -> HandlerState {
        debug_assert!(next > self, "handler state moved backwards: {self:?} -> {next:?}");
        debug_assert!(
            next != HandlerState::Rejected || self < HandlerState::Bridging,
            "rejected after bridging began: {self:?}"
        );
        tracing::trace!(from = ?self, to = ?next, "handler state transition");
        next
    }
}

/// Why the authority step failed. Logged, never shown to the client.
#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("token rejected")]
    Rejected,
    #[error("authority transport error: {0}")]
    Transport(String),
    #[error("authority response undecodable: {0}")]
    Malformed(String),
    #[error("authority did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<AuthorityError> for AuthFailure {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Rejected => Self::Rejected,
            AuthorityError::Transport(msg) => Self::Transport(msg),
            AuthorityError::Malformed(msg) => Self::Malformed(msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no console token in query string or cookie")]
    MalformedRequest,
    #[error("authentication failed: {0}")]
    AuthenticationFailure(AuthFailure),
    #[error("origin validation failed: {0}")]
    ValidationError(#[from] OriginRejection),
    #[error("console backend {host}:{port} unavailable: {source}")]
    UpstreamUnavailable {
        host: String,
        port: u16,
        source: io::Error,
    },
}

impl GatewayError {
    /// HTTP status returned instead of completing the upgrade.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            Self::ValidationError(_) => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Response body. Every authentication failure reads the same.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MalformedRequest => "missing console token",
            Self::AuthenticationFailure(_) => "console token rejected",
            Self::ValidationError(_) => "origin validation failed",
            Self::UpstreamUnavailable { .. } => "console backend unavailable",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::MalformedRequest => "malformed_request",
            Self::AuthenticationFailure(_) => "authentication_failure",
            Self::ValidationError(_) => "validation_error",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
        }
    }
}

/// A refused attempt. The attempt itself is in [`HandlerState::Rejected`];
/// `state` is the last state it reached before that.
#[derive(Debug)]
pub struct Rejection {
    pub state: HandlerState,
    pub error: GatewayError,
    /// Known once the authority has answered.
    pub console_kind: Option<ConsoleKind>,
}

impl Rejection {
    fn at(state: HandlerState, error: GatewayError, console_kind: Option<ConsoleKind>) -> Self {
        state.advance(HandlerState::Rejected);
        Self {
            state,
            error,
            console_kind,
        }
    }
}

/// An authenticated, origin-checked attempt with its backend already open.
pub struct Admission {
    /// Always [`HandlerState::Bridging`].
    pub state: HandlerState,
    pub descriptor: SessionDescriptor,
    pub backend: BoxedBackend,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// The inputs the handler decides on: query string and request headers.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl ConnectionRequest {
    pub fn new(query: Option<&str>, headers: HeaderMap) -> Self {
        Self {
            query: query.map(str::to_string),
            headers,
        }
    }

    /// The raw Origin value, for logging.
    pub fn origin(&self) -> Option<&str> {
        self.headers.get(ORIGIN).and_then(|v| v.to_str().ok())
    }
}

/// Decides whether an upgrade request may reach a console, and opens the
/// backend stream when it may.
///
/// Single pass: extract token, authenticate, check origin, connect. Nothing
/// is retried here; the connector owns its own bounded connect retry.
pub struct GatewayHandler {
    origins: Arc<OriginPolicy>,
    authority: Arc<dyn SessionAuthority>,
    connector: Arc<dyn BackendConnector>,
    authority_timeout: Duration,
}

impl GatewayHandler {
    pub fn new(
        origins: Arc<OriginPolicy>,
        authority: Arc<dyn SessionAuthority>,
        connector: Arc<dyn BackendConnector>,
        authority_timeout: Duration,
    ) -> Self {
        Self {
            origins,
            authority,
            connector,
            authority_timeout,
        }
    }

    pub fn origins(&self) -> &OriginPolicy {
        &self.origins
    }

    pub async fn admit(&self, request: &ConnectionRequest) -> Result<Admission, Rejection> {
        let mut state = HandlerState::Start;

        let token = extract_token(request.query.as_deref(), &request.headers)
            .ok_or_else(|| Rejection::at(state, GatewayError::MalformedRequest, None))?;
        state = state.advance(HandlerState::TokenExtracted);

        let descriptor = self.authenticate(&token).await.map_err(|failure| {
            Rejection::at(state, GatewayError::AuthenticationFailure(failure), None)
        })?;
        state = state.advance(HandlerState::Authenticated);

        let kind = &descriptor.console_kind;
        self.origins
            .check(kind, &request.headers)
            .map_err(|rejection| {
                Rejection::at(state, GatewayError::ValidationError(rejection), Some(kind.clone()))
            })?;
        state = state.advance(HandlerState::OriginChecked);

        let backend = self
            .connector
            .connect(&descriptor.host, descriptor.port)
            .await
            .map_err(|source| {
                let error = GatewayError::UpstreamUnavailable {
                    host: descriptor.host.clone(),
                    port: descriptor.port,
                    source,
                };
                Rejection::at(state, error, Some(kind.clone()))
            })?;
        let state = state.advance(HandlerState::Bridging);

        Ok(Admission {
            state,
            descriptor,
            backend,
        })
    }

    async fn authenticate(&self, token: &ConnectionToken) -> Result<SessionDescriptor, AuthFailure> {
        match tokio::time::timeout(self.authority_timeout, self.authority.validate(token)).await {
            Ok(result) => result.map_err(AuthFailure::from),
            Err(_) => Err(AuthFailure::Timeout(self.authority_timeout)),
        }
    }
}
