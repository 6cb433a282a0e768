use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::error;

use save_common::pgqueue::PgQueue;
use save_common::store::{Store, StoreError};

use crate::auth::IdentityVerifier;

pub mod app;
mod home;
mod lists;
mod restaurants;
mod saves;
mod users;

pub use app::add_routes;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub queue: PgQueue,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub max_attempts: i32,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ErrorReply = (StatusCode, Json<ErrorResponse>);

fn error_reply(status: StatusCode, message: impl Into<String>) -> ErrorReply {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}


/// Map store errors onto HTTP statuses. Database errors are logged and
/// collapsed into an opaque 500 so internals never leak to clients.
fn store_error(err: StoreError) -> ErrorReply {
    let status = match &err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::AlreadySaved
        | StoreError::ListNameTaken
        | StoreError::RestaurantInUse
        | StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        StoreError::ReservedListName(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StoreError::Database(_) => {
            error!("store query failed: {}", err);
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    error_reply(status, err.to_string())
}
