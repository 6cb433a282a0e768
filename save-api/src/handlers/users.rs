use axum::extract::State;
use axum::http::StatusCode;

use super::{store_error, AppState, ErrorReply};
use crate::auth::CurrentUser;

/// Delete the caller's account. Saves, lists, notes and save history all
/// cascade away with it; shared restaurant rows stay for other users.
pub async fn remove_me(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<StatusCode, ErrorReply> {
    state.store.delete_user(user.id).await.map_err(store_error)?;

    Ok(StatusCode::NO_CONTENT)
}
