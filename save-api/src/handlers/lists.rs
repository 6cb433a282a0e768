use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use save_common::store::{List, UserRestaurant};

use super::{store_error, AppState, ErrorReply};
use crate::auth::CurrentUser;

#[derive(Deserialize, Serialize, Debug)]
pub struct ListPostRequestBody {
    pub name: String,
}

pub async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<ListPostRequestBody>,
) -> Result<(StatusCode, Json<List>), ErrorReply> {
    let list = state
        .store
        .create_list(user.id, &payload.name)
        .await
        .map_err(store_error)?;

    Ok((StatusCode::CREATED, Json(list)))
}

/// Delete a list. Restaurants filed under it stay saved, just unsorted.
pub async fn remove(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorReply> {
    state
        .store
        .delete_list(user.id, id)
        .await
        .map_err(store_error)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ListAssignRequestBody {
    pub restaurant_id: Uuid,
}

/// File an already-saved restaurant into this list.
pub async fn assign(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ListAssignRequestBody>,
) -> Result<Json<UserRestaurant>, ErrorReply> {
    let link = state
        .store
        .assign_to_list(user.id, payload.restaurant_id, id)
        .await
        .map_err(store_error)?;

    Ok(Json(link))
}
