use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{error, instrument};

use crate::state::AppState;

use super::dto::{DigestErrorResponse, DigestRequest, DigestResponse};
use super::repo::PgStore;
use super::service::{self, RunOptions, RunOutcome};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub fn router() -> Router<AppState> {
    Router::new().route("/jobs/digest", post(run_digest_job))
}

type JobError = (StatusCode, Json<DigestErrorResponse>);

#[instrument(skip(state, headers, body))]
pub async fn run_digest_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DigestRequest>,
) -> Result<Json<DigestResponse>, JobError> {
    if let Some(secret) = &state.config.digest.cron_secret {
        let given = headers.get("x-cron-secret").and_then(|v| v.to_str().ok());
        if given != Some(secret.as_str()) {
            return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
    }

    if let Some(test_email) = &body.test_email {
        if !EMAIL_RE.is_match(test_email) {
            return Err(reject(StatusCode::BAD_REQUEST, "invalid test_email"));
        }
    }

    let store = PgStore::new(state.db.clone());
    let opts = RunOptions {
        dry_run: body.dry_run,
        test_email: body.test_email,
        only_emails: body.only_emails,
        exclude_emails: body.exclude_emails,
    };

    match service::run_digest(
        &store,
        state.mailer.as_ref(),
        &state.config.digest,
        &state.config.public_base_url,
        OffsetDateTime::now_utc(),
        &opts,
    )
    .await
    {
        Ok(RunOutcome::Completed { sent }) => Ok(Json(DigestResponse {
            success: true,
            sent,
            reason: None,
        })),
        Ok(RunOutcome::NoNewContent) => Ok(Json(DigestResponse {
            success: true,
            sent: 0,
            reason: Some("no_new_content"),
        })),
        Ok(RunOutcome::NoEligibleSubscribers) => Ok(Json(DigestResponse {
            success: true,
            sent: 0,
            reason: Some("no_eligible_subscribers"),
        })),
        Err(e) => {
            error!(error = %e, "digest run failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(DigestErrorResponse {
                    success: false,
                    error: e.to_string(),
                }),
            ))
        }
    }
}

fn reject(status: StatusCode, msg: &str) -> JobError {
    (
        status,
        Json(DigestErrorResponse {
            success: false,
            error: msg.into(),
        }),
    )
}
