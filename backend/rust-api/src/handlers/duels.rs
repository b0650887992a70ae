use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    extractors::{AppJson, Payload},
    handlers::ApiError,
    middlewares::auth::JwtClaims,
    models::duel_view::DuelHistoryQuery,
    services::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SubmitAnswerRequest {
    pub answer: String,
}

impl Payload for SubmitAnswerRequest {
    const NAME: &'static str = "answer payload";
}

fn parse_duel_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid pair id: {}", raw)))
}

/// Подключение к дуэли: создаёт новую пару или присоединяет к ожидающей
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Connecting user {} to a pair", claims.sub);

    let connection = state.matchmaking.connect(&claims.sub).await?;
    let view = state
        .queries
        .get_duel(connection.duel_id(), &claims.sub)
        .await?;

    Ok((StatusCode::OK, Json(view)))
}

/// Ответ на следующий вопрос текущей дуэли
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(req): AppJson<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.answers.answer(&claims.sub, &req.answer).await?;
    let view = state.queries.answer(outcome.answer_id).await?;

    Ok((StatusCode::OK, Json(view)))
}

pub async fn my_current(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.queries.current_duel(&claims.sub).await?;
    Ok((StatusCode::OK, Json(view)))
}

pub async fn get_pair(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(duel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let duel_id = parse_duel_id(&duel_id)?;
    let view = state.queries.get_duel(duel_id, &claims.sub).await?;
    Ok((StatusCode::OK, Json(view)))
}

/// История дуэлей пользователя с сортировкой и пагинацией
pub async fn my_pairs(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Query(query): Query<DuelHistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.queries.user_duels(&claims.sub, &query).await?;
    Ok((StatusCode::OK, Json(page)))
}

pub async fn my_statistic(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.queries.statistics(&claims.sub).await?;
    Ok((StatusCode::OK, Json(stats)))
}
