//! API v1 route tree.

mod nodes;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().nest("/nodes", nodes::routes())
}
