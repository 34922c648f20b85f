//! HTTP/JSON transport between replicas and relay nodes.
//!
//! Every request carries the caller's network id in `x-network-id`; a relay
//! on another network answers 409.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::descriptor::SpaceDescriptor;
use crate::exchange::{ExchangeInterface, SyncMessage, SyncResponse};
use crate::relay::Relay;
use crate::store::StoreStatus;
use crate::types::PeerId;

pub const NETWORK_HEADER: &str = "x-network-id";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub peer_id: PeerId,
    pub network_id: String,
    pub spaces: usize,
}

/// Client side: talks to a fixed list of relay endpoints. Peer ids are
/// learned from each endpoint's `/info`.
pub struct HttpExchange {
    client: reqwest::Client,
    network_id: String,
    endpoints: Vec<String>,
    routes: RwLock<HashMap<PeerId, String>>,
}

impl HttpExchange {
    pub fn new(network_id: impl Into<String>, endpoints: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            network_id: network_id.into(),
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            routes: RwLock::new(HashMap::new()),
        })
    }

    fn base_url(&self, peer: &str) -> Result<String> {
        self.routes
            .read()
            .expect("route table poisoned")
            .get(peer)
            .cloned()
            .ok_or_else(|| anyhow!("no known address for peer {peer}"))
    }

    async fn info(&self, endpoint: &str) -> Result<NodeInfo> {
        let info: NodeInfo = self
            .client
            .get(format!("{endpoint}/info"))
            .header(NETWORK_HEADER, &self.network_id)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse node info")?;
        if info.network_id != self.network_id {
            bail!(
                "{endpoint} belongs to network {}, expected {}",
                info.network_id,
                self.network_id
            );
        }
        Ok(info)
    }
}

impl ExchangeInterface for HttpExchange {
    async fn peers(&self) -> Result<Vec<PeerId>> {
        let mut peers = Vec::new();
        for endpoint in &self.endpoints {
            match self.info(endpoint).await {
                Ok(info) => {
                    self.routes
                        .write()
                        .expect("route table poisoned")
                        .insert(info.peer_id.clone(), endpoint.clone());
                    peers.push(info.peer_id);
                }
                Err(err) => debug!("Relay {endpoint} unreachable: {err:#}"),
            }
        }
        Ok(peers)
    }

    async fn sync_to(&self, peer: &PeerId, msg: SyncMessage) -> Result<SyncResponse> {
        let url = format!("{}/spaces/{}/sync", self.base_url(peer)?, msg.space_id);
        let resp = self
            .client
            .post(&url)
            .header(NETWORK_HEADER, &self.network_id)
            .json(&msg)
            .send()
            .await
            .context("Failed to send sync request")?;
        let resp = error_with_body(resp).await?;
        resp.json::<SyncResponse>()
            .await
            .context("Failed to parse sync response")
    }

    async fn push_space(&self, peer: &PeerId, descriptor: &SpaceDescriptor) -> Result<()> {
        let url = format!("{}/spaces", self.base_url(peer)?);
        let resp = self
            .client
            .post(&url)
            .header(NETWORK_HEADER, &self.network_id)
            .json(descriptor)
            .send()
            .await
            .context("Failed to push space")?;
        error_with_body(resp).await?;
        Ok(())
    }

    async fn fetch_space(&self, peer: &PeerId, space_id: &str) -> Result<Option<SpaceDescriptor>> {
        let url = format!("{}/spaces/{space_id}", self.base_url(peer)?);
        let resp = self
            .client
            .get(&url)
            .header(NETWORK_HEADER, &self.network_id)
            .send()
            .await
            .context("Failed to fetch space")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let descriptor = error_with_body(resp)
            .await?
            .json()
            .await
            .context("Failed to parse space descriptor")?;
        Ok(Some(descriptor))
    }
}

async fn error_with_body(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("{status}: {body}")
}

/// Server side: the relay's HTTP surface.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/info", get(handle_info))
        .route("/spaces", post(handle_push))
        .route("/spaces/:id", get(handle_fetch))
        .route("/spaces/:id/sync", post(handle_sync))
        .route("/debug/spaces", get(handle_debug_spaces))
        .with_state(relay)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

fn check_network(relay: &Relay, headers: &HeaderMap) -> Result<(), ApiError> {
    match headers.get(NETWORK_HEADER).map(|v| v.to_str()) {
        Some(Ok(id)) if id == relay.network_id() => Ok(()),
        Some(Ok(id)) => Err(ApiError(
            StatusCode::CONFLICT,
            format!("network mismatch: relay is on {}, request on {id}", relay.network_id()),
        )),
        Some(Err(_)) => Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("unreadable {NETWORK_HEADER} header"),
        )),
        None => Ok(()),
    }
}

async fn handle_info(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
) -> Result<Json<NodeInfo>, ApiError> {
    check_network(&relay, &headers)?;
    Ok(Json(NodeInfo {
        peer_id: relay.id().clone(),
        network_id: relay.network_id().to_string(),
        spaces: relay.space_statuses().len(),
    }))
}

async fn handle_push(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    Json(descriptor): Json<SpaceDescriptor>,
) -> Result<StatusCode, ApiError> {
    check_network(&relay, &headers)?;
    let space_id = descriptor.id.clone();
    match relay.accept_push(descriptor) {
        Ok(()) => {
            info!("Accepted push of space {space_id}");
            Ok(StatusCode::CREATED)
        }
        Err(err) => {
            warn!("Rejected push of space {space_id}: {err:#}");
            Err(ApiError(StatusCode::UNPROCESSABLE_ENTITY, format!("{err:#}")))
        }
    }
}

async fn handle_fetch(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    Path(space_id): Path<String>,
) -> Result<Json<SpaceDescriptor>, ApiError> {
    check_network(&relay, &headers)?;
    relay.descriptor(&space_id).map(Json).ok_or_else(|| {
        ApiError(StatusCode::NOT_FOUND, format!("unknown space {space_id}"))
    })
}

async fn handle_sync(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    Path(space_id): Path<String>,
    Json(msg): Json<SyncMessage>,
) -> Result<Json<SyncResponse>, ApiError> {
    check_network(&relay, &headers)?;
    if msg.space_id != space_id {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("message for {} posted to {space_id}", msg.space_id),
        ));
    }
    if relay.descriptor(&space_id).is_none() {
        return Err(ApiError(StatusCode::NOT_FOUND, format!("unknown space {space_id}")));
    }
    debug!("Received sync for {space_id} from {}", msg.sender_id);
    relay.handle_sync(msg).map(Json).map_err(|err| {
        warn!("Sync for {space_id} failed: {err:#}");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    })
}

async fn handle_debug_spaces(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
) -> Result<Json<Vec<StoreStatus>>, ApiError> {
    check_network(&relay, &headers)?;
    Ok(Json(relay.space_statuses()))
}
