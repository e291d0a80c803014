//! HTTP receiver endpoint

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use isonet_core::{Directory, Isonet, ReceiverReply, SignalReceiver};
use isonet_types::{DeliveryMode, SignalEnvelope};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::MODE_HEADER;

#[derive(Clone)]
pub struct ReceiverState {
    pub receiver: Arc<SignalReceiver>,
    pub directory: Arc<Directory>,
    pub path: Arc<String>,
}

impl ReceiverState {
    pub fn new(receiver: Arc<SignalReceiver>, directory: Arc<Directory>, path: impl Into<String>) -> Self {
        Self {
            receiver,
            directory,
            path: Arc::new(path.into()),
        }
    }

    /// State serving the receiver of a built stack on its configured path
    pub fn for_isonet(isonet: &Isonet) -> Self {
        Self::new(
            isonet.receiver().clone(),
            isonet.directory().clone(),
            isonet.config().receiver.path.clone(),
        )
    }
}

/// Routes of the receiver endpoint
///
/// Must be served with connect info, see [`serve`].
pub fn router(state: ReceiverState) -> Router {
    let path = state.path.as_str().trim_end_matches('/').to_string();
    let status_path = if path.is_empty() { "/" } else { path.as_str() };
    Router::new()
        .route("/healthz", get(healthz))
        .route(status_path, get(status))
        .route(&format!("{path}/{{*subject}}"), post(receive_signal))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until `shutdown` completes
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "signal receiver listening");
    }
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
struct StatusPayload {
    uid: String,
    name: String,
    node: String,
    access: String,
    listeners: usize,
    isolates: usize,
    client: String,
}

async fn status(
    State(state): State<ReceiverState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let identity = state.directory.local_identity();
    Json(StatusPayload {
        uid: identity.uid.to_string(),
        name: identity.name.clone(),
        node: identity.node.to_string(),
        access: state.receiver.access_info().to_string(),
        listeners: state.receiver.listener_count(),
        isolates: state.directory.len(),
        client: peer.to_string(),
    })
}

async fn receive_signal(
    State(state): State<ReceiverState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(subject): Path<String>,
    headers: HeaderMap,
    Json(mut envelope): Json<SignalEnvelope>,
) -> (StatusCode, Json<ReceiverReply>) {
    let subject = format!("/{subject}");

    let mode = match headers.get(MODE_HEADER) {
        None => DeliveryMode::default(),
        Some(value) => match value.to_str().ok().and_then(|v| v.parse().ok()) {
            Some(mode) => mode,
            None => {
                let reply = ReceiverReply::error(501, format!("Unknown mode {value:?}"));
                return (StatusCode::NOT_IMPLEMENTED, Json(reply));
            }
        },
    };

    envelope.sender_address = Some(peer.ip().to_canonical().to_string());
    debug!(%subject, %mode, peer = %peer, "signal over HTTP");

    let reply = state.receiver.handle_received(&subject, envelope, mode).await;
    let code = StatusCode::from_u16(reply.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(reply))
}
