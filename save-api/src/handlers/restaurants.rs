use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use save_common::store::{Note, Restaurant, UserRestaurant};
use save_common::types::SaveFlag;

use super::{store_error, AppState, ErrorReply};
use crate::auth::CurrentUser;

pub async fn show(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Restaurant>, ErrorReply> {
    let restaurant = state.store.get_restaurant(id).await.map_err(store_error)?;

    Ok(Json(restaurant))
}

pub async fn favorite(
    state: State<AppState>,
    user: CurrentUser,
    id: Path<Uuid>,
) -> Result<Json<UserRestaurant>, ErrorReply> {
    toggle(state, user, id, SaveFlag::Favorite).await
}

pub async fn visited(
    state: State<AppState>,
    user: CurrentUser,
    id: Path<Uuid>,
) -> Result<Json<UserRestaurant>, ErrorReply> {
    toggle(state, user, id, SaveFlag::Visited).await
}

/// Flip a flag on a saved restaurant. Turning a flag on materializes its
/// reserved list so clients have somewhere to navigate to.
async fn toggle(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(restaurant_id): Path<Uuid>,
    flag: SaveFlag,
) -> Result<Json<UserRestaurant>, ErrorReply> {
    let link = state
        .store
        .toggle_flag(user.id, restaurant_id, flag)
        .await
        .map_err(store_error)?;

    let flag_on = match flag {
        SaveFlag::Favorite => link.is_favorite,
        SaveFlag::Visited => link.is_visited,
    };
    if flag_on {
        state
            .store
            .get_or_create_reserved_list(user.id, flag.reserved_list_name())
            .await
            .map_err(store_error)?;
    }

    Ok(Json(link))
}

#[derive(Serialize)]
pub struct ExportResponse {
    pub url: String,
}

/// Deep link for handing a restaurant off to the Google Maps app. Falls
/// back to coordinates when no place id was resolved.
pub async fn export_google_maps(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ExportResponse>, ErrorReply> {
    let restaurant = state.store.get_restaurant(id).await.map_err(store_error)?;

    let url = match restaurant.place_id {
        Some(place_id) => format!("comgooglemaps://?q=place_id:{place_id}"),
        None => format!(
            "comgooglemaps://?q={},{}",
            restaurant.latitude, restaurant.longitude
        ),
    };

    Ok(Json(ExportResponse { url }))
}

#[derive(Deserialize, Serialize, Debug)]
pub struct NotePutRequestBody {
    pub content: String,
}

/// Write the caller's note for a restaurant, replacing any previous one.
pub async fn put_note(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<NotePutRequestBody>,
) -> Result<Json<Note>, ErrorReply> {
    let note = state
        .store
        .upsert_note(user.id, id, &payload.content)
        .await
        .map_err(store_error)?;

    Ok(Json(note))
}

/// Remove a restaurant from the caller's saves. Lists, flags and the note
/// for it go with the link.
pub async fn unsave(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorReply> {
    state
        .store
        .delete_user_restaurant(user.id, id)
        .await
        .map_err(store_error)?;

    Ok(StatusCode::NO_CONTENT)
}
