use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use save_common::metrics;

use super::{home, lists, restaurants, saves, users, AppState};

pub fn add_routes(
    router: Router<AppState>,
    state: AppState,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop here, just check axum health
        .route(
            "/metrics",
            routing::get(move || match metrics_handle {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route("/home", routing::get(home::show))
        .route("/saves", routing::post(saves::create))
        .route("/saves/:id", routing::get(saves::show))
        .route("/lists", routing::post(lists::create))
        .route("/lists/:id", routing::delete(lists::remove))
        .route("/lists/:id/restaurants", routing::post(lists::assign))
        .route("/restaurants/:id", routing::get(restaurants::show))
        .route(
            "/restaurants/:id/favorite",
            routing::post(restaurants::favorite),
        )
        .route(
            "/restaurants/:id/visited",
            routing::post(restaurants::visited),
        )
        .route("/restaurants/:id/notes", routing::put(restaurants::put_note))
        .route(
            "/restaurants/:id/save",
            routing::delete(restaurants::unsave),
        )
        .route(
            "/restaurants/:id/export/google-maps",
            routing::post(restaurants::export_google_maps),
        )
        .route("/users/me", routing::delete(users::remove_me))
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "savepoint api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use save_common::pgqueue::PgQueue;
    use save_common::store::Store;
    use sqlx::PgPool;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::auth::UnverifiedJsonIdentity;

    #[sqlx::test(migrations = "../migrations")]
    async fn test_index(db: PgPool) {
        let state = AppState {
            store: Store::new_from_pool(db.clone()),
            queue: PgQueue::new_from_pool("test_index", db),
            verifier: Arc::new(UnverifiedJsonIdentity),
            max_attempts: 3,
        };

        let app = add_routes(Router::new(), state, None);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"savepoint api");
    }
}
