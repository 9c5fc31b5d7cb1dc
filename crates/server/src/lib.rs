//! JSON transport over the engine's operation contract.
//!
//! The server owns no game rules: every handler deserializes a request,
//! calls one engine operation, and serializes the outcome. Domain rejections
//! come back as 409 with the structured reason; infrastructure failures are
//! logged and surface as 500. A background task runs the regeneration sweep
//! on a fixed interval.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gridlands_engine::building::{BuildOutcome, DropOutcome};
use gridlands_engine::players::{AttackOutcome, UseItemOutcome};
use gridlands_engine::protocol::{
    CellPos, CellView, Color, DetonationOutcome, ItemKind, LeaderboardRow, RejectReason,
    TapOutcome, UpgradeKind,
};
use gridlands_engine::{Engine, PlayerState};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

pub mod config;

const VIEWPORT_RADIUS_DEFAULT: i64 = 8;
const VIEWPORT_RADIUS_MAX: i64 = 32;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Handler error: a structured domain rejection or an infrastructure
/// failure. Rejections serialize their reason; failures only log it.
#[derive(Debug)]
pub enum ApiError {
    Rejected(RejectReason),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Rejected(reason) => (StatusCode::CONFLICT, Json(reason)).into_response(),
            Self::Internal(err) => {
                tracing::error!(target: "gridlands::server", error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn domain<T>(outcome: Result<T, RejectReason>) -> ApiResult<T> {
    outcome.map(Json).map_err(ApiError::Rejected)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/players/register", post(api_register))
        .route("/api/move", post(api_move))
        .route("/api/tap", post(api_tap))
        .route("/api/tap-white", post(api_tap_white))
        .route("/api/use-item", post(api_use_item))
        .route("/api/upgrade", post(api_upgrade))
        .route("/api/drop", post(api_drop))
        .route("/api/build", post(api_build))
        .route("/api/attack", post(api_attack))
        .route("/api/viewport", get(api_viewport))
        .route("/api/leaderboard", get(api_leaderboard))
        .route("/api/rev", get(api_rev))
        .with_state(Arc::new(state))
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([axum::http::header::CONTENT_TYPE])
                .allow_origin(Any),
        )
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInput {
    pub player_id: String,
    pub name: String,
}

pub async fn api_register(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RegisterInput>,
) -> ApiResult<PlayerState> {
    domain(state.engine.register_player(&input.player_id, &input.name)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveInput {
    pub player_id: String,
    pub x: i64,
    pub y: i64,
}

pub async fn api_move(
    State(state): State<Arc<AppState>>,
    Json(input): Json<MoveInput>,
) -> ApiResult<PlayerState> {
    domain(
        state
            .engine
            .move_player(&input.player_id, CellPos::new(input.x, input.y))?,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapInput {
    pub player_id: String,
    pub x: i64,
    pub y: i64,
}

/// Tap outcomes carry their own rejection reason, so this never 409s.
pub async fn api_tap(
    State(state): State<Arc<AppState>>,
    Json(input): Json<TapInput>,
) -> ApiResult<TapOutcome> {
    Ok(Json(state.engine.tap_cell(
        &input.player_id,
        CellPos::new(input.x, input.y),
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapWhiteInput {
    pub x: i64,
    pub y: i64,
}

pub async fn api_tap_white(
    State(state): State<Arc<AppState>>,
    Json(input): Json<TapWhiteInput>,
) -> ApiResult<DetonationOutcome> {
    Ok(Json(
        state.engine.tap_white_cell(CellPos::new(input.x, input.y))?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseItemInput {
    pub player_id: String,
    pub color: Color,
    pub kind: ItemKind,
}

pub async fn api_use_item(
    State(state): State<Arc<AppState>>,
    Json(input): Json<UseItemInput>,
) -> ApiResult<UseItemOutcome> {
    domain(
        state
            .engine
            .use_inventory_item(&input.player_id, &input.color, input.kind)?,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeInput {
    pub player_id: String,
    pub kind: UpgradeKind,
}

pub async fn api_upgrade(
    State(state): State<Arc<AppState>>,
    Json(input): Json<UpgradeInput>,
) -> ApiResult<PlayerState> {
    domain(state.engine.apply_upgrade(&input.player_id, input.kind)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropInput {
    pub player_id: String,
    pub color: Color,
    pub count: u32,
}

pub async fn api_drop(
    State(state): State<Arc<AppState>>,
    Json(input): Json<DropInput>,
) -> ApiResult<DropOutcome> {
    domain(
        state
            .engine
            .drop_inventory(&input.player_id, &input.color, input.count)?,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInput {
    pub player_id: String,
    pub template: String,
}

pub async fn api_build(
    State(state): State<Arc<AppState>>,
    Json(input): Json<BuildInput>,
) -> ApiResult<BuildOutcome> {
    domain(
        state
            .engine
            .build_structure(&input.player_id, &input.template)?,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackInput {
    pub attacker_id: String,
    pub target_id: String,
}

pub async fn api_attack(
    State(state): State<Arc<AppState>>,
    Json(input): Json<AttackInput>,
) -> ApiResult<AttackOutcome> {
    domain(
        state
            .engine
            .attack_player(&input.attacker_id, &input.target_id)?,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportQuery {
    pub x: i64,
    pub y: i64,
    pub radius: Option<i64>,
}

pub async fn api_viewport(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ViewportQuery>,
) -> ApiResult<Vec<CellView>> {
    let radius = query
        .radius
        .unwrap_or(VIEWPORT_RADIUS_DEFAULT)
        .clamp(0, VIEWPORT_RADIUS_MAX);
    Ok(Json(
        state.engine.viewport(CellPos::new(query.x, query.y), radius)?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardQuery {
    /// Comma-separated player ids; defaults to every registered player.
    pub ids: Option<String>,
}

pub async fn api_leaderboard(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Vec<LeaderboardRow>> {
    let ids = match query.ids {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => state.engine.list_player_ids()?,
    };
    Ok(Json(state.engine.leaderboard(&ids)?))
}

/// Monotonic world revision; clients poll this to decide when to refetch
/// their viewport.
pub async fn api_rev(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let rev = state.engine.get_rev()?;
    Ok(Json(serde_json::json!({ "rev": rev })))
}

/// Periodic regeneration sweep. A failed cycle is logged and skipped; the
/// task never exits on its own.
pub fn spawn_sweep_task(engine: Engine, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let engine = engine.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut rng = SmallRng::from_entropy();
                engine.run_regeneration_sweep(&mut rng)
            })
            .await;
            match result {
                Ok(Ok(report)) => {
                    tracing::debug!(
                        target: "gridlands::server",
                        regenerated = report.regenerated,
                        "sweep cycle done"
                    );
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: "gridlands::server",
                        error = %err,
                        "sweep cycle failed; skipping"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "gridlands::server",
                        error = %err,
                        "sweep task panicked; skipping cycle"
                    );
                }
            }
        }
    })
}

pub async fn serve(
    addr: SocketAddr,
    db_path: PathBuf,
    sweep_period: Duration,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, db_path, sweep_period, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    db_path: PathBuf,
    sweep_period: Duration,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let engine = Engine::new(db_path);
    let sweeper = spawn_sweep_task(engine.clone(), sweep_period);
    let app = build_router(AppState { engine });
    let addr = listener.local_addr()?;
    tracing::info!(target: "gridlands::server", %addr, "listening");
    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    sweeper.abort();
    result?;
    Ok(addr)
}
