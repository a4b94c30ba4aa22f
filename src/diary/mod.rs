pub mod dto;
pub mod extractor;
pub mod handlers;
#[cfg(test)]
pub(crate) mod memory;
pub mod pipeline;
pub mod repo;
pub mod repo_types;
pub mod services;
pub mod transcription;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::read_routes())
        .merge(handlers::write_routes())
}
