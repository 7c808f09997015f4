mod dto;
pub mod handlers;
pub mod matcher;
pub mod render;
pub mod repo;
pub mod service;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    handlers::router()
}
