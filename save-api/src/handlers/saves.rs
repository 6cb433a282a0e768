use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use save_common::pgqueue::NewSaveJob;
use save_common::store::{NewSaveEvent, SaveEvent};

use super::{error_reply, store_error, AppState, ErrorReply};
use crate::auth::CurrentUser;

const MAX_CAPTION_SIZE: usize = 10_000;

/// The body of a request made to capture a save.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SavePostRequestBody {
    pub source: String,
    pub source_url: String,
    #[serde(default)]
    pub raw_caption: Option<String>,
    #[serde(default)]
    pub target_list_id: Option<Uuid>,
}

/// Record a save event and enqueue it for processing. Returns 202 with the
/// pending event; clients poll `GET /saves/:id` for the outcome.
pub async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<SavePostRequestBody>,
) -> Result<(StatusCode, Json<SaveEvent>), ErrorReply> {
    debug!("received save: {:?}", payload);

    if Url::parse(&payload.source_url).is_err() {
        return Err(error_reply(
            StatusCode::BAD_REQUEST,
            "could not parse source_url",
        ));
    }

    if payload
        .raw_caption
        .as_ref()
        .is_some_and(|caption| caption.len() > MAX_CAPTION_SIZE)
    {
        return Err(error_reply(StatusCode::BAD_REQUEST, "caption too large"));
    }

    // A bad list id fails the request here, not the pipeline later.
    if let Some(list_id) = payload.target_list_id {
        state
            .store
            .get_list(user.id, list_id)
            .await
            .map_err(store_error)?;
    }

    let event = state
        .store
        .create_save_event(NewSaveEvent {
            user_id: user.id,
            source: payload.source,
            source_url: payload.source_url,
            raw_caption: payload.raw_caption,
            target_list_id: payload.target_list_id,
        })
        .await
        .map_err(store_error)?;

    let start_time = Instant::now();

    state
        .queue
        .enqueue(NewSaveJob::new(event.id, state.max_attempts))
        .await
        .map_err(|err| {
            error!("failed to enqueue save job for event {}: {}", event.id, err);
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("save_api_enqueue").record(elapsed_time);

    Ok((StatusCode::ACCEPTED, Json(event)))
}

/// Fetch one of the caller's save events, including its status and any
/// completion or failure message.
pub async fn show(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SaveEvent>, ErrorReply> {
    let event = state
        .store
        .get_save_event_for_user(id, user.id)
        .await
        .map_err(store_error)?;

    Ok(Json(event))
}
