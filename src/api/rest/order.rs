use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::confirmation::ConfirmationView;
use crate::engine::lifecycle::LifecycleController;
use crate::engine::push::Connectivity;
use crate::engine::store::OrderSnapshot;
use crate::error::AppError;
use crate::models::confirmation::ConfirmationReport;
use crate::models::order::{DeliveryOrder, Evidence};
use crate::models::step::WorkflowStep;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/order", get(get_order).put(bind_order).delete(unbind_order))
        .route("/order/transition", post(transition))
        .route("/order/confirm", post(confirm))
        .route("/order/refresh", post(refresh))
        .route("/history", get(history))
        .route("/confirmations", get(confirmations))
}

/// Everything the UI renders for the active order.
#[derive(Debug, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub snapshot: OrderSnapshot,
    pub connectivity: Connectivity,
    pub confirmation: Option<ConfirmationView>,
}

impl OrderView {
    pub async fn capture(controller: &LifecycleController) -> Self {
        Self {
            snapshot: controller.snapshot(),
            connectivity: controller.connectivity(),
            confirmation: controller.confirmation().await,
        }
    }
}

#[derive(Deserialize)]
pub struct BindRequest {
    pub order_id: Uuid,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub target: WorkflowStep,
}

async fn get_order(State(state): State<Arc<AppState>>) -> Json<OrderView> {
    Json(OrderView::capture(&state.controller).await)
}

async fn bind_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BindRequest>,
) -> Result<Json<OrderView>, AppError> {
    state.controller.bind(payload.order_id).await?;
    Ok(Json(OrderView::capture(&state.controller).await))
}

async fn unbind_order(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DeliveryOrder>, AppError> {
    let order = state
        .controller
        .unbind()
        .await
        .ok_or_else(|| AppError::NotFound("no active order".to_string()))?;

    Ok(Json(order))
}

async fn transition(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TransitionRequest>,
) -> Result<StatusCode, AppError> {
    state.controller.request_transition(payload.target).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn confirm(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Evidence>,
) -> Result<StatusCode, AppError> {
    if payload.uri.trim().is_empty() {
        return Err(AppError::BadRequest("evidence uri must not be empty".to_string()));
    }

    state.controller.start_confirmation_phase(payload).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn refresh(State(state): State<Arc<AppState>>) -> Result<Json<OrderView>, AppError> {
    state.controller.refresh().await?;
    Ok(Json(OrderView::capture(&state.controller).await))
}

async fn history(State(state): State<Arc<AppState>>) -> Json<Vec<DeliveryOrder>> {
    Json(state.controller.history())
}

async fn confirmations(State(state): State<Arc<AppState>>) -> Json<Vec<ConfirmationReport>> {
    Json(state.controller.confirmations())
}
