mod dto;
pub mod handlers;
mod repo;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    handlers::router()
}

pub fn public_router() -> Router<AppState> {
    handlers::public_router()
}
