//! REST surface over the engine: handlers validate input, translate to
//! engine calls and map error kinds onto HTTP statuses. Admin routes
//! answer loopback connections only.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::error::EngineError;
use crate::swap::engine::{Engine, InitRequest, SwapEvent};
use crate::swap::{hash32_from_hex, Direction, LpRole, RoutingMode, Swap, SwapState};

pub type AppState = Arc<Engine>;

pub fn create_router(engine: AppState) -> Router {
    Router::new()
        .route("/api/flowswap/init", post(init))
        .route("/api/flowswap/init-leg", post(init_leg))
        .route("/api/flowswap/list", get(list))
        .route("/api/flowswap/:id", get(get_swap))
        .route("/api/flowswap/:id/btc-funded", post(btc_funded))
        .route("/api/flowswap/:id/usdc-funded", post(usdc_funded))
        .route("/api/flowswap/:id/m1-locked", post(m1_locked))
        .route("/api/flowswap/:id/btc-claimed", post(btc_claimed))
        .route("/api/admin/swap/:id/force-fail", post(force_fail))
        .route("/api/admin/cleanup-terminal", post(cleanup_terminal))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

pub async fn serve(engine: AppState, port: u16) -> anyhow::Result<()> {
    let app = create_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "starting flowswap api");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

enum ApiError {
    Engine(EngineError),
    Message(StatusCode, String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Message(status, message) => (status, message),
            ApiError::Engine(err) => {
                let status = match &err {
                    EngineError::UnknownSwap(_) => StatusCode::NOT_FOUND,
                    EngineError::BadState { .. } => StatusCode::BAD_REQUEST,
                    EngineError::StateConflict(_) => StatusCode::CONFLICT,
                    EngineError::TransientChain { .. }
                    | EngineError::PeerUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    EngineError::PermanentChain { .. }
                    | EngineError::InvariantViolation(_)
                    | EngineError::UnrecoverableRefund(_)
                    | EngineError::ReorgRollback { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError::Message(StatusCode::BAD_REQUEST, msg.into())
}

#[derive(Debug, Deserialize)]
struct InitBody {
    direction: Direction,
    from_amount: u64,
    h_user: String,
    user_pubkey: Option<String>,
    #[serde(default)]
    user_refund_address: String,
    #[serde(default)]
    user_payout_address: String,
}

#[derive(Debug, Deserialize)]
struct InitLegBody {
    #[serde(flatten)]
    base: InitBody,
    role: LpRole,
    peer_url: String,
    h_lp1: Option<String>,
    h_lp2: Option<String>,
}

async fn init(
    State(engine): State<AppState>,
    Json(body): Json<InitBody>,
) -> Result<Json<Swap>, ApiError> {
    let req = init_request(&body, RoutingMode::SingleLp, None, None)?;
    let swap = engine.init_swap(req).await?;
    Ok(Json(swap))
}

async fn init_leg(
    State(engine): State<AppState>,
    Json(body): Json<InitLegBody>,
) -> Result<Json<Swap>, ApiError> {
    if body.peer_url.trim().is_empty() {
        return Err(bad_request("peer_url is required"));
    }
    let h_lp1 = body
        .h_lp1
        .as_deref()
        .map(hash32_from_hex)
        .transpose()?;
    let h_lp2 = body
        .h_lp2
        .as_deref()
        .map(hash32_from_hex)
        .transpose()?;
    let routing = RoutingMode::PerLeg {
        role: body.role,
        peer_url: body.peer_url.trim().to_string(),
    };
    let req = init_request(&body.base, routing, h_lp1, h_lp2)?;
    let swap = engine.init_swap(req).await?;
    Ok(Json(swap))
}

fn init_request(
    body: &InitBody,
    routing: RoutingMode,
    h_lp1: Option<crate::swap::Hash32>,
    h_lp2: Option<crate::swap::Hash32>,
) -> Result<InitRequest, ApiError> {
    if body.from_amount == 0 {
        return Err(bad_request("from_amount must be > 0"));
    }
    let h_user = hash32_from_hex(&body.h_user)?;
    let user_pubkey = body
        .user_pubkey
        .as_deref()
        .map(|s| {
            let bytes = hex::decode(s)
                .map_err(|e| bad_request(format!("invalid user_pubkey: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| bad_request("user_pubkey must be 33 bytes"))
        })
        .transpose()?;

    Ok(InitRequest {
        direction: body.direction,
        routing,
        from_amount: body.from_amount,
        h_user,
        h_lp1,
        h_lp2,
        user_pubkey,
        user_refund_address: body.user_refund_address.trim().to_string(),
        user_payout_address: body.user_payout_address.trim().to_string(),
    })
}

async fn get_swap(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Swap>, ApiError> {
    Ok(Json(engine.get_swap(&id)?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    state: Option<SwapState>,
    limit: Option<usize>,
}

async fn list(
    State(engine): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Swap>> {
    Json(engine.list_swaps(query.state, query.limit.unwrap_or(100)))
}

#[derive(Debug, Deserialize)]
struct FundedHint {
    #[serde(default)]
    txid: String,
}

/// User-facing hint that funding was sent. The watchers stay
/// authoritative; this only acknowledges and surfaces current state.
async fn btc_funded(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(hint): Json<FundedHint>,
) -> Result<Json<Swap>, ApiError> {
    let swap = engine.get_swap(&id)?;
    tracing::info!(swap_id = %id, txid = %hint.txid, "user reports btc funding");
    Ok(Json(swap))
}

async fn usdc_funded(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(hint): Json<FundedHint>,
) -> Result<Json<Swap>, ApiError> {
    let swap = engine.get_swap(&id)?;
    tracing::info!(swap_id = %id, txid = %hint.txid, "user reports usdc funding");
    Ok(Json(swap))
}

#[derive(Debug, Deserialize)]
struct M1LockedBody {
    outpoint: String,
    amount_sats: u64,
    expiry_height: u64,
    redeem_script_hex: String,
}

/// Peer notification (we are LP_OUT): the inbound leg's M1 HTLC exists.
async fn m1_locked(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<M1LockedBody>,
) -> Result<Json<Swap>, ApiError> {
    engine
        .handle_event(
            &id,
            SwapEvent::PeerM1Locked {
                outpoint: body.outpoint,
                amount_sats: body.amount_sats,
                expiry_height: body.expiry_height,
                redeem_script_hex: body.redeem_script_hex,
            },
        )
        .await?;
    Ok(Json(engine.get_swap(&id)?))
}

#[derive(Debug, Deserialize)]
struct SecretsBody {
    claim_txid: String,
    s_user: String,
    s_lp1: String,
    s_lp2: String,
}

/// Peer notification (we are LP_IN): the revealed preimages came back.
async fn btc_claimed(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SecretsBody>,
) -> Result<Json<Swap>, ApiError> {
    engine
        .handle_event(
            &id,
            SwapEvent::PeerSecrets {
                s_user: hash32_from_hex(&body.s_user)?,
                s_lp1: hash32_from_hex(&body.s_lp1)?,
                s_lp2: hash32_from_hex(&body.s_lp2)?,
                claim_txid: body.claim_txid,
            },
        )
        .await?;
    Ok(Json(engine.get_swap(&id)?))
}

fn require_loopback(addr: &SocketAddr) -> Result<(), Response> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "admin endpoints are localhost-only" })),
        )
            .into_response())
    }
}

async fn force_fail(
    State(engine): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_loopback(&addr) {
        return resp;
    }
    match engine.force_fail(&id).await {
        Ok(swap) => Json(swap).into_response(),
        Err(err) => ApiError::Engine(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    max_age_hours: Option<u64>,
}

async fn cleanup_terminal(
    State(engine): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<CleanupQuery>,
) -> Response {
    if let Err(resp) = require_loopback(&addr) {
        return resp;
    }
    let max_age = query
        .max_age_hours
        .unwrap_or(engine.ctx().cfg.archive_grace_hours);
    match engine.archive_terminal(max_age) {
        Ok(archived) => Json(serde_json::json!({ "archived": archived })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}
