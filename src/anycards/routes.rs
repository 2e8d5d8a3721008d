//! REST endpoints for anycard records.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::model::{Anycard, AnycardInput, AnycardType};
use crate::error::{DatabaseError, TaskError};
use crate::store::Database;

/// Shared state for anycard routes.
#[derive(Clone)]
pub struct AnycardRouteState {
    pub db: Arc<dyn Database>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    anycard_type: Option<String>,
    card_number: Option<String>,
}

fn not_found(id: &str) -> TaskError {
    TaskError::Database(DatabaseError::NotFound {
        entity: "anycard".into(),
        id: id.to_string(),
    })
}

fn validate(input: &AnycardInput) -> Result<(), TaskError> {
    if input.card_number.trim().is_empty() {
        return Err(TaskError::InvalidRequest("cardNumber is required".into()));
    }
    Ok(())
}

/// GET /api/anycards?anycardType=&cardNumber=
///
/// Most recently updated first. `cardNumber` matches as a substring.
async fn list_anycards(
    State(state): State<AnycardRouteState>,
    Query(params): Query<ListParams>,
) -> Response {
    let wanted_type = match params.anycard_type.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => match raw.parse::<AnycardType>() {
            Ok(t) => Some(t),
            Err(e) => return e.into_response(),
        },
        None => None,
    };
    let number = params.card_number.filter(|s| !s.trim().is_empty());

    match state.db.list_anycards().await {
        Ok(cards) => {
            let mut cards: Vec<Anycard> = cards
                .into_iter()
                .filter(|c| wanted_type.is_none_or(|t| c.anycard_type == t))
                .filter(|c| {
                    number
                        .as_deref()
                        .is_none_or(|n| c.card_number.contains(n.trim()))
                })
                .collect();
            cards.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Json(cards).into_response()
        }
        Err(e) => TaskError::from(e).into_response(),
    }
}

/// GET /api/anycards/{id}
async fn get_anycard(State(state): State<AnycardRouteState>, Path(id): Path<String>) -> Response {
    let Ok(uuid) = Uuid::parse_str(id.trim()) else {
        return not_found(&id).into_response();
    };
    match state.db.get_anycard(uuid).await {
        Ok(Some(card)) => Json(card).into_response(),
        Ok(None) => not_found(&id).into_response(),
        Err(e) => TaskError::from(e).into_response(),
    }
}

/// POST /api/anycards
async fn create_anycard(
    State(state): State<AnycardRouteState>,
    Json(input): Json<AnycardInput>,
) -> Response {
    if let Err(e) = validate(&input) {
        return e.into_response();
    }
    let mut card = Anycard::new(input.card_number.trim(), input.anycard_type);
    card.apply(AnycardInput {
        card_number: input.card_number.trim().to_string(),
        ..input
    });
    match state.db.insert_anycard(&card).await {
        Ok(()) => {
            info!(anycard_id = %card.id, "Anycard created");
            Json(card).into_response()
        }
        Err(e) => TaskError::from(e).into_response(),
    }
}

/// PUT /api/anycards/{id}
async fn update_anycard(
    State(state): State<AnycardRouteState>,
    Path(id): Path<String>,
    Json(input): Json<AnycardInput>,
) -> Response {
    if let Err(e) = validate(&input) {
        return e.into_response();
    }
    let Ok(uuid) = Uuid::parse_str(id.trim()) else {
        return not_found(&id).into_response();
    };
    let mut card = match state.db.get_anycard(uuid).await {
        Ok(Some(card)) => card,
        Ok(None) => return not_found(&id).into_response(),
        Err(e) => return TaskError::from(e).into_response(),
    };
    card.apply(AnycardInput {
        card_number: input.card_number.trim().to_string(),
        ..input
    });
    match state.db.update_anycard(&card).await {
        Ok(()) => {
            info!(anycard_id = %card.id, needs_redeem = card.needs_redeem, "Anycard updated");
            Json(card).into_response()
        }
        Err(e) => TaskError::from(e).into_response(),
    }
}

/// Build the anycard REST routes.
pub fn anycard_routes(db: Arc<dyn Database>) -> Router {
    Router::new()
        .route("/api/anycards", get(list_anycards).post(create_anycard))
        .route("/api/anycards/{id}", get(get_anycard).put(update_anycard))
        .with_state(AnycardRouteState { db })
}
