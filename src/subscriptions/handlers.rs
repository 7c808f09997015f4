use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::digest::render::decode_unsubscribe_token;
use crate::state::AppState;

use super::dto::{
    PreferencesResponse, UnsubscribeQuery, UnsubscribeResponse, UpdatePreferencesRequest,
};
use super::repo::{PgSubscriptions, SubscriptionStore};

pub fn router() -> Router<AppState> {
    Router::new().route("/users/:id/digest-preferences", put(update_preferences))
}

/// The unsubscribe link target lives at the site root, outside the API nest,
/// because it is what outbound emails point at.
pub fn public_router() -> Router<AppState> {
    Router::new().route("/unsubscribe", get(unsubscribe))
}

#[instrument(skip(state, q))]
pub async fn unsubscribe(
    State(state): State<AppState>,
    Query(q): Query<UnsubscribeQuery>,
) -> Result<Json<UnsubscribeResponse>, (StatusCode, String)> {
    let store = PgSubscriptions::new(state.db.clone());
    handle_unsubscribe(&store, &q.token).await
}

#[instrument(skip(state, body))]
pub async fn update_preferences(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<UpdatePreferencesRequest>,
) -> Result<Json<PreferencesResponse>, (StatusCode, String)> {
    let store = PgSubscriptions::new(state.db.clone());
    handle_update_preferences(&store, user_id, body).await
}

async fn handle_unsubscribe(
    store: &dyn SubscriptionStore,
    token: &str,
) -> Result<Json<UnsubscribeResponse>, (StatusCode, String)> {
    let Some(user_id) = decode_unsubscribe_token(token) else {
        return Err((StatusCode::BAD_REQUEST, "invalid token".into()));
    };

    match store.disable_weekly_digest(user_id).await {
        Ok(true) => {
            info!(%user_id, "unsubscribed from weekly digest");
            Ok(Json(UnsubscribeResponse { success: true }))
        }
        Ok(false) => Err((StatusCode::NOT_FOUND, "unknown subscriber".into())),
        Err(e) => {
            error!(%user_id, error = %e, "unsubscribe failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "internal error".into()))
        }
    }
}

async fn handle_update_preferences(
    store: &dyn SubscriptionStore,
    user_id: Uuid,
    body: UpdatePreferencesRequest,
) -> Result<Json<PreferencesResponse>, (StatusCode, String)> {
    let prefs = store
        .upsert_preferences(
            user_id,
            body.weekly_digest_enabled,
            &body.skills_wanted,
            &body.skills_wanted_custom,
        )
        .await
        .map_err(|e| {
            error!(%user_id, error = %e, "preference update failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(PreferencesResponse {
        user_id: prefs.user_id,
        weekly_digest_enabled: prefs.weekly_digest_enabled,
        skills_wanted: prefs.skills_wanted,
        skills_wanted_custom: prefs.skills_wanted_custom,
        last_digest_sent_at: prefs.last_digest_sent_at,
    }))
}
