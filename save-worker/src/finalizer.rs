//! Final stage of the pipeline: link the user to the resolved restaurant
//! and close out the save event, atomically.

use save_common::store::{Restaurant, SaveEvent, Store, StoreError, UserRestaurant};
use save_common::types::SaveEventStatus;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::PipelineError;

/// Benign completion note recorded when the user had already saved the
/// restaurant. Surfaces to clients through the event's message field.
pub const DUPLICATE_MESSAGE: &str = "Restaurant already saved";

#[derive(Debug)]
pub enum FinalizeOutcome {
    /// A new link was written for this user and restaurant.
    Linked(UserRestaurant),
    /// The user had saved this restaurant before; the existing link was
    /// left untouched.
    Duplicate,
}

#[derive(Clone)]
pub struct Finalizer {
    store: Store,
}

impl Finalizer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Write the user/restaurant link and mark the event complete in one
    /// transaction, so a crash can never leave a link without a closed
    /// event or vice versa.
    ///
    /// A unique violation on the link means this user already saved this
    /// restaurant, possibly through a concurrent event. That is converged
    /// to a successful completion rather than reported as a failure.
    pub async fn finalize(
        &self,
        event: &SaveEvent,
        restaurant: &Restaurant,
    ) -> Result<FinalizeOutcome, PipelineError> {
        let mut txn = self.store.pool().begin().await.map_err(StoreError::from)?;

        let inserted = Store::insert_user_restaurant(
            &mut txn,
            event.user_id,
            restaurant.id,
            event.target_list_id,
            event.id,
        )
        .await;

        match inserted {
            Ok(link) => {
                complete_event(&mut txn, event.id, None).await?;
                txn.commit().await.map_err(StoreError::from)?;

                Ok(FinalizeOutcome::Linked(link))
            }
            Err(StoreError::AlreadySaved) => {
                // The violation aborted the transaction; the duplicate
                // completion needs a fresh one.
                txn.rollback().await.map_err(StoreError::from)?;

                let mut txn = self.store.pool().begin().await.map_err(StoreError::from)?;
                complete_event(&mut txn, event.id, Some(DUPLICATE_MESSAGE)).await?;
                txn.commit().await.map_err(StoreError::from)?;

                Ok(FinalizeOutcome::Duplicate)
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Guarded completion inside the finalizer's transaction. Only an event
/// still in processing may complete; anything else aborts the dual-write.
async fn complete_event(
    txn: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    message: Option<&str>,
) -> Result<(), PipelineError> {
    let updated = sqlx::query(
        r#"
UPDATE save_events
SET status = 'complete', error_message = $2
WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(event_id)
    .bind(message)
    .execute(&mut **txn)
    .await
    .map_err(StoreError::from)?;

    if updated.rows_affected() == 0 {
        let current: Option<(SaveEventStatus,)> =
            sqlx::query_as("SELECT status FROM save_events WHERE id = $1")
                .bind(event_id)
                .fetch_optional(&mut **txn)
                .await
                .map_err(StoreError::from)?;

        let error = match current {
            Some((from,)) => StoreError::InvalidTransition {
                from,
                to: SaveEventStatus::Complete,
            },
            None => StoreError::NotFound {
                entity: "save event",
            },
        };
        return Err(error.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use save_common::store::{NewRestaurant, NewSaveEvent, User};
    use sqlx::PgPool;

    async fn seed_user(store: &Store) -> User {
        store
            .upsert_user_from_identity("sub_finalize", "finalize@example.com", Some("Fin"))
            .await
            .unwrap()
    }

    async fn seed_restaurant(store: &Store) -> Restaurant {
        store
            .create_restaurant(NewRestaurant {
                name: "Lucali".to_owned(),
                city: "Brooklyn".to_owned(),
                latitude: 40.7128,
                longitude: -74.0060,
                price_range: Some("$$".to_owned()),
                place_id: None,
            })
            .await
            .unwrap()
    }

    async fn seed_processing_event(
        store: &Store,
        user_id: Uuid,
        target_list_id: Option<Uuid>,
    ) -> SaveEvent {
        let event = store
            .create_save_event(NewSaveEvent {
                user_id,
                source: "instagram".to_owned(),
                source_url: "https://example.com/p/fin".to_owned(),
                raw_caption: Some("pizza night".to_owned()),
                target_list_id,
            })
            .await
            .unwrap();

        store.mark_processing(event.id).await.unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_finalize_links_and_completes(db: PgPool) {
        let store = Store::new_from_pool(db);
        let finalizer = Finalizer::new(store.clone());

        let user = seed_user(&store).await;
        let restaurant = seed_restaurant(&store).await;
        let event = seed_processing_event(&store, user.id, None).await;

        let outcome = finalizer.finalize(&event, &restaurant).await.unwrap();
        let link = match outcome {
            FinalizeOutcome::Linked(link) => link,
            other => panic!("expected a new link, got {:?}", other),
        };

        assert_eq!(link.user_id, user.id);
        assert_eq!(link.restaurant_id, restaurant.id);
        assert_eq!(link.source_event_id, event.id);
        assert_eq!(link.list_id, None);

        let event = store.get_save_event(event.id).await.unwrap().unwrap();
        assert_eq!(event.status, SaveEventStatus::Complete);
        assert_eq!(event.error_message, None);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_finalize_honors_target_list(db: PgPool) {
        let store = Store::new_from_pool(db);
        let finalizer = Finalizer::new(store.clone());

        let user = seed_user(&store).await;
        let restaurant = seed_restaurant(&store).await;
        let list = store.create_list(user.id, "Date night").await.unwrap();
        let event = seed_processing_event(&store, user.id, Some(list.id)).await;

        let outcome = finalizer.finalize(&event, &restaurant).await.unwrap();

        match outcome {
            FinalizeOutcome::Linked(link) => assert_eq!(link.list_id, Some(list.id)),
            other => panic!("expected a new link, got {:?}", other),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_finalize_converges_duplicates(db: PgPool) {
        let store = Store::new_from_pool(db);
        let finalizer = Finalizer::new(store.clone());

        let user = seed_user(&store).await;
        let restaurant = seed_restaurant(&store).await;

        let first = seed_processing_event(&store, user.id, None).await;
        finalizer.finalize(&first, &restaurant).await.unwrap();

        let second = seed_processing_event(&store, user.id, None).await;
        let outcome = finalizer.finalize(&second, &restaurant).await.unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Duplicate));

        let second = store.get_save_event(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, SaveEventStatus::Complete);
        assert_eq!(second.error_message.as_deref(), Some(DUPLICATE_MESSAGE));

        // The original link still points at its own source event.
        let link = store
            .find_user_restaurant(user.id, restaurant.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.source_event_id, first.id);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_finalize_rolls_back_when_event_not_processing(db: PgPool) {
        let store = Store::new_from_pool(db);
        let finalizer = Finalizer::new(store.clone());

        let user = seed_user(&store).await;
        let restaurant = seed_restaurant(&store).await;
        let event = store
            .create_save_event(NewSaveEvent {
                user_id: user.id,
                source: "instagram".to_owned(),
                source_url: "https://example.com/p/pending".to_owned(),
                raw_caption: None,
                target_list_id: None,
            })
            .await
            .unwrap();

        let result = finalizer.finalize(&event, &restaurant).await;
        assert!(matches!(
            result,
            Err(PipelineError::Store(StoreError::InvalidTransition { .. }))
        ));

        // The link insert must not survive the failed completion.
        let link = store
            .find_user_restaurant(user.id, restaurant.id)
            .await
            .unwrap();
        assert!(link.is_none());
    }
}
