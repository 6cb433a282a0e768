use axum::extract::State;
use axum::Json;
use serde_derive::Serialize;

use save_common::store::{List, SavedRestaurant};

use super::{store_error, AppState, ErrorReply};
use crate::auth::CurrentUser;

#[derive(Serialize)]
pub struct HomeResponse {
    pub lists: Vec<List>,
    pub unsorted_restaurants: Vec<SavedRestaurant>,
}

/// The library feed: the caller's lists plus their saves not yet filed
/// into any list.
pub async fn show(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<HomeResponse>, ErrorReply> {
    let lists = state
        .store
        .lists_for_user(user.id)
        .await
        .map_err(store_error)?;
    let unsorted_restaurants = state
        .store
        .unsorted_saved_restaurants(user.id)
        .await
        .map_err(store_error)?;

    Ok(Json(HomeResponse {
        lists,
        unsorted_restaurants,
    }))
}
