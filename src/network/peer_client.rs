//! Point-to-point peer RPC client. The peer HTTP listener sits one port
//! below the overlay listener on every node; that `-1` is contractual.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::network::dht::Dht;
use crate::network::node_id::Contact;
use crate::utils::metrics::METRICS;

/// Hard response cap for `random_request`, independent of the per-request
/// HTTP timeout.
pub const RANDOM_REQUEST_CAP: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum PeerRpcError {
    #[error("peer request timed out")]
    Timeout,
    #[error("peer returned http {0}")]
    HttpNon200(u16),
    #[error("peer transport: {0}")]
    Transport(String),
    #[error("no healthy peers")]
    NoPeers,
}

pub struct PeerClient {
    http: reqwest::Client,
    magic: String,
    version: String,
}

impl PeerClient {
    pub fn new(magic: String, version: String, request_timeout: Duration) -> Result<Self, PeerRpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PeerRpcError::Transport(e.to_string()))?;
        Ok(Self { http, magic, version })
    }

    /// `POST http://{host}:{port-1}/peer/{method}` with the `magic` and
    /// `version` headers and a JSON body.
    pub async fn request(
        &self,
        method: &str,
        params: &Value,
        contact: &Contact,
    ) -> Result<Value, PeerRpcError> {
        let url = peer_url(contact, method);
        let response = self
            .http
            .post(&url)
            .header("magic", &self.magic)
            .header("version", &self.version)
            .json(params)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            METRICS.inc("peer.http_error");
            return Err(PeerRpcError::HttpNon200(status.as_u16()));
        }
        response.json::<Value>().await.map_err(classify)
    }

    /// Ask one random healthy peer, under the global 4-second cap.
    pub async fn random_request(
        &self,
        method: &str,
        params: &Value,
        dht: &Arc<Dht>,
    ) -> Result<(Value, Contact), PeerRpcError> {
        let peer = dht
            .random_healthy(1)
            .await
            .pop()
            .ok_or(PeerRpcError::NoPeers)?;
        let result = timeout(RANDOM_REQUEST_CAP, self.request(method, params, &peer))
            .await
            .map_err(|_| {
                METRICS.inc("peer.random_request_capped");
                PeerRpcError::Timeout
            })??;
        Ok((result, peer))
    }

    /// Ask a bootstrap peer for our externally-observed address.
    pub async fn observed_ip(&self, contact: &Contact) -> Result<String, PeerRpcError> {
        let url = format!(
            "http://{}:{}/api/p2phelper",
            contact.host,
            contact.port.saturating_sub(1)
        );
        let response = self
            .http
            .post(&url)
            .header("magic", &self.magic)
            .header("version", &self.version)
            .json(&Value::Null)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(PeerRpcError::HttpNon200(response.status().as_u16()));
        }
        let body: Value = response.json().await.map_err(classify)?;
        body.get("ip")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                debug!("p2phelper reply without ip field");
                PeerRpcError::Transport("malformed p2phelper reply".into())
            })
    }
}

fn classify(e: reqwest::Error) -> PeerRpcError {
    if e.is_timeout() {
        METRICS.inc("peer.timeout");
        PeerRpcError::Timeout
    } else {
        METRICS.inc("peer.transport_error");
        PeerRpcError::Transport(e.to_string())
    }
}

/// Peer RPC endpoint for a contact: one port below its overlay port.
pub fn peer_url(contact: &Contact, method: &str) -> String {
    format!(
        "http://{}:{}/peer/{}",
        contact.host,
        contact.port.saturating_sub(1),
        method
    )
}
