//! # Store
//!
//! The relational entity store for users, restaurants, lists, save events,
//! user-restaurant links and notes. Ownership and cascade rules live in the
//! database schema; this module's job is to run the queries and to translate
//! constraint violations into typed errors the pipeline can act on.
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{is_reserved_list_name, SaveEventStatus, SaveFlag};

/// Enumeration of errors for operations on the entity store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("restaurant already saved by this user")]
    AlreadySaved,
    #[error("a list with this name already exists")]
    ListNameTaken,
    #[error("{0} is a reserved list name")]
    ReservedListName(String),
    #[error("restaurant is still saved by at least one user")]
    RestaurantInUse,
    #[error("save event status cannot move from {from} to {to}")]
    InvalidTransition {
        from: SaveEventStatus,
        to: SaveEventStatus,
    },
    #[error("query failed with: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Transient infrastructure errors must propagate to the queue layer so
    /// the message is redelivered; everything else is a business outcome.
    /// Constraint violations are mapped to typed variants at each call site,
    /// so whatever still surfaces as `Database` is connectivity or worse.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Return true if `error` is a PostgreSQL unique constraint violation.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Return true if `error` is a PostgreSQL foreign key violation.
pub fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503"))
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    /// Stable subject id from the external identity provider.
    pub external_subject_id: Option<String>,
    pub email: String,
    pub name: Option<String>,
    /// Absent for externally authenticated users.
    #[serde(skip_serializing)]
    pub hashed_password: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Restaurant {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub price_range: Option<String>,
    /// External place-lookup id; unique when present.
    pub place_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct List {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The durable audit record of one capture attempt.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SaveEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: String,
    pub source_url: String,
    pub raw_caption: Option<String>,
    pub target_list_id: Option<Uuid>,
    pub status: SaveEventStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The link entity for "this user saved this restaurant".
/// Unique per (user_id, restaurant_id); `list_id = NULL` means unsorted.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UserRestaurant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub restaurant_id: Uuid,
    pub list_id: Option<Uuid>,
    pub source_event_id: Uuid,
    pub is_favorite: bool,
    pub is_visited: bool,
    pub created_at: DateTime<Utc>,
}

/// Read model for the library feed: one saved restaurant with the flags of
/// its link folded in.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SavedRestaurant {
    pub restaurant_id: Uuid,
    pub name: String,
    pub city: String,
    pub price_range: Option<String>,
    pub is_favorite: bool,
    pub is_visited: bool,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Note {
    pub id: Uuid,
    pub user_id: Uuid,
    pub restaurant_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRestaurant {
    pub name: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub price_range: Option<String>,
    pub place_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSaveEvent {
    pub user_id: Uuid,
    pub source: String,
    pub source_url: String,
    pub raw_caption: Option<String>,
    pub target_list_id: Option<Uuid>,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A handle on the entity store, cheap to clone and inject.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Initialize a new Store by connecting a pool to the database in `url`.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)?;

        Ok(Self { pool })
    }

    /// Initialize a new Store from a provided connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for callers that need to run their own
    /// transaction spanning several writes (e.g. the finalizer).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // --- Users ---

    /// Resolve a user from verified identity claims, creating one on first
    /// login. Lookup order: external subject id, then email (backfilling the
    /// subject id and name on legacy rows), then insert. A concurrent first
    /// login loses the insert race to a unique violation and reselects.
    pub async fn upsert_user_from_identity(
        &self,
        subject: &str,
        email: &str,
        name: Option<&str>,
    ) -> StoreResult<User> {
        if let Some(user) =
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE external_subject_id = $1")
                .bind(subject)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(user);
        }

        if let Some(user) = sqlx::query_as::<_, User>(
            r#"
UPDATE users
SET external_subject_id = $1, name = COALESCE(name, $2)
WHERE email = $3
RETURNING *
            "#,
        )
        .bind(subject)
        .bind(name)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(user);
        }

        let inserted = sqlx::query_as::<_, User>(
            r#"
INSERT INTO users (external_subject_id, email, name)
VALUES ($1, $2, $3)
RETURNING *
            "#,
        )
        .bind(subject)
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(user) => Ok(user),
            Err(error) if is_unique_violation(&error) => {
                sqlx::query_as::<_, User>("SELECT * FROM users WHERE external_subject_id = $1")
                    .bind(subject)
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or(StoreError::NotFound { entity: "user" })
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn get_user(&self, id: Uuid) -> StoreResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "user" })
    }

    /// Delete a user. Cascades remove their lists, notes, save events and
    /// saved restaurants; shared restaurant rows are untouched.
    pub async fn delete_user(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "user" });
        }
        Ok(())
    }

    // --- Restaurants ---

    /// Exact-match lookup by (name, city). Case-sensitive by design; see the
    /// resolver for why spelling variants produce distinct rows.
    pub async fn find_restaurant_by_name_city(
        &self,
        name: &str,
        city: &str,
    ) -> StoreResult<Option<Restaurant>> {
        let restaurant = sqlx::query_as::<_, Restaurant>(
            "SELECT * FROM restaurants WHERE name = $1 AND city = $2",
        )
        .bind(name)
        .bind(city)
        .fetch_optional(&self.pool)
        .await?;

        Ok(restaurant)
    }

    /// Insert a restaurant. If a concurrent insert of the same (name, city)
    /// wins the race, the unique index rejects ours and we return the
    /// winner's row instead.
    pub async fn create_restaurant(&self, new: NewRestaurant) -> StoreResult<Restaurant> {
        let inserted = sqlx::query_as::<_, Restaurant>(
            r#"
INSERT INTO restaurants (name, city, latitude, longitude, price_range, place_id)
VALUES ($1, $2, $3, $4, $5, $6)
RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(&new.city)
        .bind(new.latitude)
        .bind(new.longitude)
        .bind(&new.price_range)
        .bind(&new.place_id)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(restaurant) => Ok(restaurant),
            Err(error) if is_unique_violation(&error) => self
                .find_restaurant_by_name_city(&new.name, &new.city)
                .await?
                .ok_or(StoreError::Database(error)),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn get_restaurant(&self, id: Uuid) -> StoreResult<Restaurant> {
        sqlx::query_as::<_, Restaurant>("SELECT * FROM restaurants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "restaurant",
            })
    }

    /// Delete a restaurant. Rejected while any user still has it saved.
    pub async fn delete_restaurant(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM restaurants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StoreError::NotFound {
                entity: "restaurant",
            }),
            Ok(_) => Ok(()),
            Err(error) if is_foreign_key_violation(&error) => Err(StoreError::RestaurantInUse),
            Err(error) => Err(error.into()),
        }
    }

    // --- Lists ---

    /// Create a user-owned list. Reserved names are rejected here, at the
    /// boundary; per-user name uniqueness (trimmed, case-insensitive) is
    /// enforced by the database index.
    pub async fn create_list(&self, user_id: Uuid, name: &str) -> StoreResult<List> {
        let name = name.trim();
        if is_reserved_list_name(name) {
            return Err(StoreError::ReservedListName(name.to_owned()));
        }

        let inserted =
            sqlx::query_as::<_, List>("INSERT INTO lists (user_id, name) VALUES ($1, $2) RETURNING *")
                .bind(user_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await;

        match inserted {
            Ok(list) => Ok(list),
            Err(error) if is_unique_violation(&error) => Err(StoreError::ListNameTaken),
            Err(error) => Err(error.into()),
        }
    }

    /// Lazily materialize one of the system-managed lists for a user.
    /// Goes straight to the insert, bypassing the reserved-name rejection.
    pub async fn get_or_create_reserved_list(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> StoreResult<List> {
        debug_assert!(is_reserved_list_name(name));

        if let Some(list) = sqlx::query_as::<_, List>(
            "SELECT * FROM lists WHERE user_id = $1 AND LOWER(TRIM(name)) = LOWER(TRIM($2))",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(list);
        }

        let inserted =
            sqlx::query_as::<_, List>("INSERT INTO lists (user_id, name) VALUES ($1, $2) RETURNING *")
                .bind(user_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await;

        match inserted {
            Ok(list) => Ok(list),
            // Lost a concurrent first-use race; the list now exists.
            Err(error) if is_unique_violation(&error) => sqlx::query_as::<_, List>(
                "SELECT * FROM lists WHERE user_id = $1 AND LOWER(TRIM(name)) = LOWER(TRIM($2))",
            )
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::Database(error)),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn lists_for_user(&self, user_id: Uuid) -> StoreResult<Vec<List>> {
        let lists =
            sqlx::query_as::<_, List>("SELECT * FROM lists WHERE user_id = $1 ORDER BY created_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(lists)
    }

    pub async fn get_list(&self, user_id: Uuid, list_id: Uuid) -> StoreResult<List> {
        sqlx::query_as::<_, List>("SELECT * FROM lists WHERE id = $1 AND user_id = $2")
            .bind(list_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "list" })
    }

    /// Delete a user-owned list. Member restaurants become unsorted and save
    /// events that targeted this list keep their history (both via
    /// ON DELETE SET NULL). System-managed lists cannot be deleted here.
    pub async fn delete_list(&self, user_id: Uuid, list_id: Uuid) -> StoreResult<()> {
        let list = self.get_list(user_id, list_id).await?;
        if is_reserved_list_name(&list.name) {
            return Err(StoreError::ReservedListName(list.name));
        }

        sqlx::query("DELETE FROM lists WHERE id = $1 AND user_id = $2")
            .bind(list_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // --- Save events ---

    pub async fn create_save_event(&self, new: NewSaveEvent) -> StoreResult<SaveEvent> {
        let event = sqlx::query_as::<_, SaveEvent>(
            r#"
INSERT INTO save_events (user_id, source, source_url, raw_caption, target_list_id)
VALUES ($1, $2, $3, $4, $5)
RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(&new.source)
        .bind(&new.source_url)
        .bind(&new.raw_caption)
        .bind(new.target_list_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    pub async fn get_save_event(&self, id: Uuid) -> StoreResult<Option<SaveEvent>> {
        let event = sqlx::query_as::<_, SaveEvent>("SELECT * FROM save_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(event)
    }

    pub async fn get_save_event_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<SaveEvent> {
        sqlx::query_as::<_, SaveEvent>("SELECT * FROM save_events WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "save event",
            })
    }

    /// Transition a save event to processing. Re-entry from processing is
    /// allowed (queue redelivery); terminal states are not.
    pub async fn mark_processing(&self, id: Uuid) -> StoreResult<SaveEvent> {
        let updated = sqlx::query_as::<_, SaveEvent>(
            r#"
UPDATE save_events
SET status = 'processing'
WHERE id = $1 AND status IN ('pending', 'processing')
RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(event) => Ok(event),
            None => Err(self.transition_error(id, SaveEventStatus::Processing).await?),
        }
    }

    /// Transition a save event to its successful terminal state.
    /// `message` carries the benign "Restaurant already saved" note for
    /// duplicate captures; it is not an error.
    pub async fn complete_save_event(
        &self,
        id: Uuid,
        message: Option<&str>,
    ) -> StoreResult<SaveEvent> {
        let updated = sqlx::query_as::<_, SaveEvent>(
            r#"
UPDATE save_events
SET status = 'complete', error_message = $2
WHERE id = $1 AND status = 'processing'
RETURNING *
            "#,
        )
        .bind(id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(event) => Ok(event),
            None => Err(self.transition_error(id, SaveEventStatus::Complete).await?),
        }
    }

    /// Transition a save event to its failed terminal state, recording a
    /// human-readable message for user-visible reporting.
    pub async fn fail_save_event(&self, id: Uuid, message: &str) -> StoreResult<SaveEvent> {
        let updated = sqlx::query_as::<_, SaveEvent>(
            r#"
UPDATE save_events
SET status = 'failed', error_message = $2
WHERE id = $1 AND status = 'processing'
RETURNING *
            "#,
        )
        .bind(id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(event) => Ok(event),
            None => Err(self.transition_error(id, SaveEventStatus::Failed).await?),
        }
    }

    /// Build the error for a guarded status update that matched no row:
    /// either the event is gone or the transition is illegal.
    async fn transition_error(
        &self,
        id: Uuid,
        to: SaveEventStatus,
    ) -> StoreResult<StoreError> {
        match self.get_save_event(id).await? {
            Some(event) => {
                debug_assert!(!event.status.can_transition(to));
                Ok(StoreError::InvalidTransition {
                    from: event.status,
                    to,
                })
            }
            None => Ok(StoreError::NotFound {
                entity: "save event",
            }),
        }
    }

    // --- User restaurants ---

    /// Insert the link row inside a caller-owned transaction, so it can be
    /// committed together with other writes. A duplicate (user, restaurant)
    /// pair surfaces as `AlreadySaved`; note that the violation aborts the
    /// transaction, so the caller must roll back before doing anything else.
    pub async fn insert_user_restaurant(
        txn: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        restaurant_id: Uuid,
        list_id: Option<Uuid>,
        source_event_id: Uuid,
    ) -> StoreResult<UserRestaurant> {
        let inserted = sqlx::query_as::<_, UserRestaurant>(
            r#"
INSERT INTO user_restaurants (user_id, restaurant_id, list_id, source_event_id)
VALUES ($1, $2, $3, $4)
RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(restaurant_id)
        .bind(list_id)
        .bind(source_event_id)
        .fetch_one(&mut **txn)
        .await;

        match inserted {
            Ok(link) => Ok(link),
            Err(error) if is_unique_violation(&error) => Err(StoreError::AlreadySaved),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn find_user_restaurant(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
    ) -> StoreResult<Option<UserRestaurant>> {
        let link = sqlx::query_as::<_, UserRestaurant>(
            "SELECT * FROM user_restaurants WHERE user_id = $1 AND restaurant_id = $2",
        )
        .bind(user_id)
        .bind(restaurant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    /// The unsorted shelf of the library: links not filed into any list,
    /// newest save first.
    pub async fn unsorted_saved_restaurants(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<SavedRestaurant>> {
        let saved = sqlx::query_as::<_, SavedRestaurant>(
            r#"
SELECT ur.restaurant_id, r.name, r.city, r.price_range,
       ur.is_favorite, ur.is_visited, ur.created_at AS saved_at
FROM user_restaurants ur
JOIN restaurants r ON r.id = ur.restaurant_id
WHERE ur.user_id = $1 AND ur.list_id IS NULL
ORDER BY ur.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(saved)
    }

    /// Re-file a saved restaurant into a list (the user must own both).
    pub async fn assign_to_list(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        list_id: Uuid,
    ) -> StoreResult<UserRestaurant> {
        // Owner-scoped lookup so one user cannot file into another's list.
        self.get_list(user_id, list_id).await?;

        sqlx::query_as::<_, UserRestaurant>(
            r#"
UPDATE user_restaurants
SET list_id = $3
WHERE user_id = $1 AND restaurant_id = $2
RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(restaurant_id)
        .bind(list_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "saved restaurant",
        })
    }

    /// Flip one of the closed set of boolean flags on a saved restaurant,
    /// returning the updated link. The restaurant must already be saved.
    pub async fn toggle_flag(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        flag: SaveFlag,
    ) -> StoreResult<UserRestaurant> {
        // `flag.column()` comes from a closed enum, never from user input.
        let query = format!(
            "UPDATE user_restaurants SET {column} = NOT {column} \
             WHERE user_id = $1 AND restaurant_id = $2 RETURNING *",
            column = flag.column()
        );

        sqlx::query_as::<_, UserRestaurant>(&query)
            .bind(user_id)
            .bind(restaurant_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "saved restaurant",
            })
    }

    pub async fn delete_user_restaurant(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM user_restaurants WHERE user_id = $1 AND restaurant_id = $2",
        )
        .bind(user_id)
        .bind(restaurant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "saved restaurant",
            });
        }
        Ok(())
    }

    // --- Notes ---

    /// One note per (user, restaurant), written in place.
    pub async fn upsert_note(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        content: &str,
    ) -> StoreResult<Note> {
        let upserted = sqlx::query_as::<_, Note>(
            r#"
INSERT INTO notes (user_id, restaurant_id, content)
VALUES ($1, $2, $3)
ON CONFLICT (user_id, restaurant_id)
DO UPDATE SET content = EXCLUDED.content, updated_at = NOW()
RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(restaurant_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await;

        match upserted {
            Ok(note) => Ok(note),
            Err(error) if is_foreign_key_violation(&error) => Err(StoreError::NotFound {
                entity: "restaurant",
            }),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn get_note(&self, user_id: Uuid, restaurant_id: Uuid) -> StoreResult<Option<Note>> {
        let note = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE user_id = $1 AND restaurant_id = $2",
        )
        .bind(user_id)
        .bind(restaurant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(note)
    }
}
