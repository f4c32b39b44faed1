//! Node API endpoints.
//!
//! `/boot` and `/checkin` are the machine-facing entry points (firmware
//! microkernel and in-band agent respectively); the rest is the thin
//! administrative surface over the same services.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mandrel_events::{CheckinAction, PowerState};
use mandrel_id::{NodeId, PolicyId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::hwinfo::{HwDescriptor, JsonMap};
use crate::identity::{LookupRequest, MetadataPatch};
use crate::node::Node;
use crate::state::AppState;

/// Create node routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/boot", post(boot))
        .route("/checkin", post(checkin))
        .route("/", get(search))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/log", get(get_log))
        .route("/{node_id}/stage-done", post(stage_done))
        .route("/{node_id}/metadata", patch(modify_metadata))
        .route("/{node_id}/desired-power", post(set_desired_power))
        .route("/{node_id}/reboot", post(reboot))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Firmware boot report. The body is the raw hardware descriptor,
/// e.g. `{"net0": "aa:bb:...", "serial": "S9", "dhcp_mac": "..."}`.
#[derive(Debug, Deserialize)]
pub struct BootRequest {
    #[serde(flatten)]
    pub hw_info: HwDescriptor,
}

/// Agent checkin: the current fact snapshot.
#[derive(Debug, Deserialize)]
pub struct CheckinRequest {
    #[serde(default)]
    pub facts: Option<JsonMap>,
}

/// Response for a resolved node plus whether this call created it.
#[derive(Debug, Serialize)]
pub struct BootResponse {
    pub node: NodeResponse,
    pub created: bool,
}

/// Response for the checkin directive.
#[derive(Debug, Serialize)]
pub struct CheckinActionResponse {
    pub action: CheckinAction,
}

/// Request for a completed installer stage.
#[derive(Debug, Deserialize)]
pub struct StageDoneRequest {
    pub name: String,
}

/// Request to set the desired power state.
#[derive(Debug, Deserialize)]
pub struct DesiredPowerRequest {
    pub desired: PowerState,
}

/// A node, with credentials omitted.
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: String,
    pub name: String,
    pub hw_info: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp_mac: Option<String>,
    pub facts: JsonMap,
    pub metadata: JsonMap,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub boot_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkin: Option<DateTime<Utc>>,
    pub desired_power_state: PowerState,
    pub last_known_power_state: PowerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_power_state_update_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipmi_hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name,
            hw_info: node.hw_info,
            dhcp_mac: node.dhcp_mac,
            facts: node.facts,
            metadata: node.metadata,
            tags: node.tags,
            policy_id: node.policy_id,
            installed: node.installed,
            installed_at: node.installed_at,
            hostname: node.hostname,
            boot_count: node.boot_count,
            last_checkin: node.last_checkin,
            desired_power_state: node.desired_power_state,
            last_known_power_state: node.last_known_power_state,
            last_power_state_update_at: node.last_power_state_update_at,
            ipmi_hostname: node.ipmi_hostname,
            created_at: node.created_at,
            updated_at: node.updated_at,
        }
    }
}

/// Response for listing nodes.
#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub items: Vec<NodeResponse>,
    pub total: usize,
}

/// Response for a node's event log.
#[derive(Debug, Serialize)]
pub struct NodeLogResponse {
    pub items: Vec<Value>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Resolve a firmware boot report to a node. 201 when the node was
/// created by this call.
async fn boot(
    State(state): State<AppState>,
    Json(request): Json<BootRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = LookupRequest::from_parts(None, Some(request.hw_info))?;
    let (node, created) = state.resolver().lookup(&lookup).await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(BootResponse {
            node: node.into(),
            created,
        }),
    ))
}

/// Resolve an agent fact report and process the checkin.
async fn checkin(
    State(state): State<AppState>,
    Json(request): Json<CheckinRequest>,
) -> Result<Json<CheckinActionResponse>, ApiError> {
    let facts = request.facts.unwrap_or_default();
    let lookup = LookupRequest::from_parts(Some(facts.clone()), None)?;
    let (node, _created) = state.resolver().lookup(&lookup).await?;

    let response = state.checkin().checkin(node.id, &facts).await?;
    Ok(Json(CheckinActionResponse {
        action: response.action,
    }))
}

/// Search nodes. `hostname` is a case-insensitive regex (downgraded to a
/// literal substring if it does not compile); every other query key is a
/// fingerprint key filter. All conditions are ANDed.
async fn search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ListNodesResponse>, ApiError> {
    let mut filter = crate::db::SearchFilter::default();
    for (key, value) in params {
        if key == "hostname" {
            filter.hostname = Some(value);
        } else {
            filter.hw.push((key, value));
        }
    }

    let nodes = state
        .store()
        .search(&filter)
        .await
        .map_err(crate::error::CoreError::from)?;
    let items: Vec<NodeResponse> = nodes.into_iter().map(Into::into).collect();
    let total = items.len();
    Ok(Json(ListNodesResponse { items, total }))
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeResponse>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let node = state
        .store()
        .get(node_id)
        .await
        .map_err(crate::error::CoreError::from)?
        .ok_or(crate::error::CoreError::NotFound(node_id))?;
    Ok(Json(node.into()))
}

async fn get_log(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeLogResponse>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    state
        .store()
        .get(node_id)
        .await
        .map_err(crate::error::CoreError::from)?
        .ok_or(crate::error::CoreError::NotFound(node_id))?;

    let items = state
        .log()
        .entries(node_id)
        .await
        .map_err(crate::error::CoreError::from)?;
    Ok(Json(NodeLogResponse { items }))
}

/// Record a completed installer stage; `finished` seals the install.
async fn stage_done(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(request): Json<StageDoneRequest>,
) -> Result<Json<NodeResponse>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let node = state.lifecycle().stage_done(node_id, &request.name).await?;
    Ok(Json(node.into()))
}

async fn modify_metadata(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(patch): Json<MetadataPatch>,
) -> Result<Json<NodeResponse>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let node = state.lifecycle().modify_metadata(node_id, &patch).await?;
    Ok(Json(node.into()))
}

async fn set_desired_power(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(request): Json<DesiredPowerRequest>,
) -> Result<Json<NodeResponse>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let node = state
        .lifecycle()
        .set_desired_power(node_id, request.desired)
        .await?;
    Ok(Json(node.into()))
}

/// Power-cycle the node through the management channel.
async fn reboot(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    state.power().reboot(node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_node_id(raw: &str) -> Result<NodeId, ApiError> {
    NodeId::parse(raw)
        .map_err(|e| ApiError::bad_request("invalid_node_id", format!("bad node id '{raw}': {e}")))
}
