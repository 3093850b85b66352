//! Peer HTTP surface, served one port below the overlay listener:
//! `POST /peer/<method>` (magic + version gated), `GET /api/peers`,
//! `GET /api/peers/version`, `POST /api/p2phelper`, `GET /api/metrics`.

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Extension, Json, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::network::dht::Dht;
use crate::network::version;
use crate::utils::metrics::METRICS;

/// Peers listed by `GET /api/peers` at most.
const MAX_LISTED_PEERS: usize = 100;

/// Server side of the peer RPC: the node wiring implements this and routes
/// methods into consensus/gossip.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value, remote: SocketAddr) -> anyhow::Result<Value>;
}

pub struct PeerApiContext {
    pub dht: Arc<Dht>,
    pub handler: Arc<dyn PeerHandler>,
    pub magic: String,
    pub version: String,
    pub build: String,
    pub net: String,
    pub min_version: [u32; 3],
}

pub struct PeerServer {
    addr: SocketAddr,
    ctx: Arc<PeerApiContext>,
}

impl PeerServer {
    pub fn new(addr: SocketAddr, ctx: Arc<PeerApiContext>) -> Self {
        Self { addr, ctx }
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/peer/:method", post(peer_method))
            .route("/api/peers", get(list_peers))
            .route("/api/peers/version", get(peer_version))
            .route("/api/p2phelper", post(p2p_helper))
            .route("/api/metrics", get(metrics_snapshot))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(Extension(self.ctx.clone())),
            );

        info!("peer api listening on {}", self.addr);
        axum::Server::bind(&self.addr)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }
}

fn rejected() -> Response {
    // remote peers never learn why; details stay in local logs/metrics
    (StatusCode::BAD_REQUEST, axum::Json(json!({ "success": false }))).into_response()
}

async fn peer_method(
    Path(method): Path<String>,
    Extension(ctx): Extension<Arc<PeerApiContext>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(params): Json<Value>,
) -> Response {
    let magic = headers.get("magic").and_then(|v| v.to_str().ok()).unwrap_or("");
    if magic != ctx.magic {
        METRICS.inc("peer_api.bad_magic");
        debug!("peer call {} from {} with wrong magic", method, remote);
        return rejected();
    }
    let peer_version = headers.get("version").and_then(|v| v.to_str().ok()).unwrap_or("");
    if !version::is_compatible(peer_version, ctx.min_version) {
        METRICS.inc("peer_api.incompatible_version");
        debug!("peer call {} from {} with version {}", method, remote, peer_version);
        return rejected();
    }

    match ctx.handler.handle(&method, params, remote).await {
        Ok(result) => axum::Json(result).into_response(),
        Err(e) => {
            METRICS.inc("peer_api.handler_rejected");
            debug!("peer method {} rejected: {}", method, e);
            (StatusCode::OK, axum::Json(json!({ "success": false }))).into_response()
        }
    }
}

async fn list_peers(Extension(ctx): Extension<Arc<PeerApiContext>>) -> Response {
    let mut peers = ctx.dht.healthy_nodes().await;
    peers.truncate(MAX_LISTED_PEERS);
    let listed: Vec<Value> = peers
        .iter()
        .map(|c| {
            json!({
                "id": c.id.to_hex(),
                "host": c.host,
                "port": c.port,
                "seen": c.seen,
            })
        })
        .collect();
    axum::Json(json!({ "peers": listed })).into_response()
}

async fn peer_version(Extension(ctx): Extension<Arc<PeerApiContext>>) -> Response {
    axum::Json(json!({
        "version": ctx.version,
        "build": ctx.build,
        "net": ctx.net,
    }))
    .into_response()
}

/// Echo the caller's externally-observed address; the basis for self-IP
/// discovery.
async fn p2p_helper(ConnectInfo(remote): ConnectInfo<SocketAddr>) -> Response {
    axum::Json(json!({ "ip": remote.ip().to_string() })).into_response()
}

async fn metrics_snapshot() -> Response {
    let (counters, gauges) = METRICS.snapshot();
    axum::Json(json!({ "counters": counters, "gauges": gauges })).into_response()
}
