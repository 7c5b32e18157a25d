use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use audit_log::{AttemptOutcome, AuditEntry, AuditEventType, AuditSink, AuditSource};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::bridge::{self, BridgeEnd, BridgeLimits, BridgeSummary};
use crate::handler::{Admission, ConnectionRequest, GatewayHandler, HandlerState, Rejection};

/// Subprotocol noVNC and SPICE HTML5 ask for. A browser that offers a
/// subprotocol fails the connection unless the server selects one.
const BINARY_SUBPROTOCOL: &str = "binary";

const COMPONENT: &str = "console-proxy";

pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub handler: GatewayHandler,
    pub audit: AuditSink,
    pub bridge: BridgeLimits,
}

struct GatewayState {
    handler: GatewayHandler,
    audit: AuditSink,
    bridge: BridgeLimits,
}

/// The console gateway server.
///
/// Every request path is a console endpoint. The handler runs before the
/// WebSocket upgrade completes, so a refused attempt gets a plain HTTP error
/// and never sees `101 Switching Protocols`. Admitted attempts are upgraded
/// and bridged to the backend that was opened during admission.
pub struct Gateway {
    listen_addr: SocketAddr,
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            listen_addr: config.listen_addr,
            state: Arc::new(GatewayState {
                handler: config.handler,
                audit: config.audit,
                bridge: config.bridge,
            }),
        }
    }

    /// Serve on the configured address until the process ends.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve on the configured address until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    /// In-flight bridges keep running until their connections close.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let kinds: Vec<String> = self
            .state
            .handler
            .origins()
            .kinds()
            .map(ToString::to_string)
            .collect();
        tracing::info!(%addr, ?kinds, "console gateway listening");

        let app = router(self.state);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!(%addr, "console gateway stopped");
        Ok(())
    }
}

fn router(state: Arc<GatewayState>) -> Router {
    Router::new().fallback(console_upgrade).with_state(state)
}

async fn console_upgrade(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let attempt_id = uuid::Uuid::new_v4();
    let request = ConnectionRequest::new(uri.query(), headers);
    let origin = request.origin().map(str::to_string);
    let source = AuditSource::new(COMPONENT)
        .with_remote_addr(remote_addr)
        .with_origin(origin.as_deref())
        .with_attempt_id(attempt_id);

    let Admission {
        state: handler_state,
        descriptor,
        backend,
    } = match state.handler.admit(&request).await {
        Ok(admission) => admission,
        Err(rejection) => return reject(&state.audit, source, rejection).await,
    };

    tracing::info!(
        %attempt_id,
        %remote_addr,
        origin = origin.as_deref().unwrap_or("<none>"),
        console_kind = %descriptor.console_kind,
        backend_host = %descriptor.host,
        backend_port = descriptor.port,
        "console connection admitted"
    );
    state
        .audit
        .log(
            AuditEntry::new(
                AuditEventType::ConnectionAdmitted,
                source.clone(),
                serde_json::json!({
                    "backend_host": descriptor.host,
                    "backend_port": descriptor.port,
                }),
            )
            .with_outcome(AttemptOutcome {
                category: "admitted".to_string(),
                console_kind: Some(descriptor.console_kind.to_string()),
                reason: "token and origin accepted".to_string(),
            }),
        )
        .await;

    let limits = state.bridge;
    let audit = state.audit.clone();
    let failed_audit = state.audit.clone();
    let failed_source = source.clone();
    ws.protocols([BINARY_SUBPROTOCOL])
        .on_failed_upgrade(move |err: axum::Error| {
            tracing::warn!(%attempt_id, %err, "websocket upgrade failed; backend dropped");
            log_upgrade_failed(failed_audit, failed_source, err.to_string());
        })
        .on_upgrade(move |socket| async move {
            tracing::debug!(%attempt_id, "bridging");
            let summary = bridge::bridge(socket, backend, limits).await;
            let closed = handler_state.advance(HandlerState::Closed);
            log_bridge_closed(&audit, source, attempt_id, closed, summary).await;
        })
}

/// Close the audit record of an admitted attempt whose upgrade never
/// completed. Runs from a synchronous callback, so the write is spawned.
fn log_upgrade_failed(audit: AuditSink, source: AuditSource, error: String) -> JoinHandle<()> {
    let entry = AuditEntry::new(
        AuditEventType::BridgeClosed,
        source,
        serde_json::json!({
            "end": "upgrade_failed",
            "error": error,
            "bytes_to_backend": 0,
            "bytes_to_client": 0,
        }),
    );
    tokio::spawn(async move {
        audit.log(entry).await;
    })
}

async fn reject(audit: &AuditSink, source: AuditSource, rejection: Rejection) -> Response {
    let Rejection {
        state,
        error,
        console_kind,
    } = rejection;

    tracing::warn!(
        attempt_id = source.attempt_id.as_deref().unwrap_or_default(),
        remote_addr = source.remote_addr.as_deref().unwrap_or_default(),
        origin = source.origin.as_deref().unwrap_or("<none>"),
        ?state,
        %error,
        "console connection rejected"
    );

    let status = error.status();
    audit
        .log(
            AuditEntry::new(
                AuditEventType::ConnectionRejected,
                source,
                serde_json::json!({
                    "status": status.as_u16(),
                    "state": format!("{state:?}"),
                }),
            )
            .with_outcome(AttemptOutcome {
                category: error.category().to_string(),
                console_kind: console_kind.map(|k| k.to_string()),
                reason: error.to_string(),
            }),
        )
        .await;

    (status, error.public_message()).into_response()
}

async fn log_bridge_closed(
    audit: &AuditSink,
    source: AuditSource,
    attempt_id: uuid::Uuid,
    state: HandlerState,
    summary: BridgeSummary,
) {
    let end = match &summary.end {
        BridgeEnd::ClientClosed => "client_closed".to_string(),
        BridgeEnd::BackendClosed => "backend_closed".to_string(),
        BridgeEnd::Failed(failure) => failure.to_string(),
    };

    match &summary.end {
        BridgeEnd::Failed(failure) => tracing::warn!(
            %attempt_id,
            ?state,
            %failure,
            "bridge failed"
        ),
        _ => tracing::info!(
            %attempt_id,
            ?state,
            bytes_to_backend = summary.bytes_to_backend,
            bytes_to_client = summary.bytes_to_client,
            end = %end,
            "bridge closed"
        ),
    }

    audit
        .log(AuditEntry::new(
            AuditEventType::BridgeClosed,
            source,
            serde_json::json!({
                "end": end,
                "bytes_to_backend": summary.bytes_to_backend,
                "bytes_to_client": summary.bytes_to_client,
            }),
        ))
        .await;
}
