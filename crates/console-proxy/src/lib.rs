//! Authenticating WebSocket gateway for remote consoles.
//!
//! Browser console clients (noVNC, SPICE HTML5, serial terminals) connect
//! here with a single-use token. The gateway validates the token with the
//! session authority, checks the browser's `Origin` against the base URL
//! configured for the console kind, opens a TCP stream to the console backend
//! and only then completes the WebSocket upgrade and relays raw bytes.
//!
//! # Architecture
//!
//! ```text
//! Browser  <--WS-->  console-proxy  <--TCP-->  console backend
//!                        |
//!            [token] [authority] [origin]
//!                        |
//!                   [Audit Sink]
//! ```
//!
//! [`GatewayHandler`] is the per-connection state machine. It takes the
//! request's query string and headers as plain inputs and talks to the
//! outside world only through the [`SessionAuthority`] and
//! [`BackendConnector`] ports. [`Gateway`] puts it in front of an `axum`
//! WebSocket endpoint.

pub mod authority;
pub mod bridge;
pub mod handler;
pub mod listener;
pub mod origin;
pub mod token;

pub use authority::{AuthorityError, ConsoleKind, HttpAuthority, SessionAuthority, SessionDescriptor};
pub use bridge::{
    BackendConnector, BoxedBackend, BridgeEnd, BridgeLimits, BridgeSummary, StreamFailure, TcpConnector,
};
pub use handler::{
    Admission, AuthFailure, ConnectionRequest, GatewayError, GatewayHandler, HandlerState, Rejection,
};
pub use listener::{Gateway, GatewayConfig};
pub use origin::{OriginConfigError, OriginExpectation, OriginPolicy, OriginRejection};
pub use token::{extract_token, ConnectionToken};
