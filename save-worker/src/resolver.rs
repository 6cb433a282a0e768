//! Resolution of extracted candidates into canonical restaurant rows.

use std::sync::Arc;

use async_trait::async_trait;
use save_common::store::{NewRestaurant, Restaurant, Store};

use crate::error::PipelineError;
use crate::extract::Extraction;

/// Details a place provider can contribute when a restaurant is first seen.
#[derive(Debug, Clone)]
pub struct PlaceDetails {
    pub latitude: f64,
    pub longitude: f64,
    pub price_range: Option<String>,
    pub place_id: Option<String>,
}

impl Default for PlaceDetails {
    fn default() -> Self {
        Self {
            latitude: 40.7128,
            longitude: -74.0060,
            price_range: Some("$$".to_owned()),
            place_id: None,
        }
    }
}

/// Source of coordinates and pricing for restaurants we have not seen
/// before. Implementations must be cheap to call repeatedly with the same
/// input; resolution may retry.
#[async_trait]
pub trait PlaceLookup: Send + Sync {
    async fn lookup(&self, name: &str, city: &str) -> PlaceDetails;
}

/// Placeholder provider returning fixed coordinates and the lowest price
/// band for every place.
pub struct StaticPlaceLookup;

#[async_trait]
impl PlaceLookup for StaticPlaceLookup {
    async fn lookup(&self, _name: &str, _city: &str) -> PlaceDetails {
        PlaceDetails::default()
    }
}

/// Maps an extraction to exactly one canonical restaurant row, creating it
/// on first sight. Matching is exact on (name, city); the database's unique
/// index arbitrates concurrent first sights.
#[derive(Clone)]
pub struct Resolver {
    store: Store,
    places: Arc<dyn PlaceLookup>,
}

impl Resolver {
    pub fn new(store: Store, places: Arc<dyn PlaceLookup>) -> Self {
        Self { store, places }
    }

    pub async fn resolve(&self, extraction: &Extraction) -> Result<Restaurant, PipelineError> {
        if let Some(existing) = self
            .store
            .find_restaurant_by_name_city(&extraction.name, &extraction.city)
            .await?
        {
            return Ok(existing);
        }

        let details = self.places.lookup(&extraction.name, &extraction.city).await;

        // create_restaurant reselects the winning row when a concurrent
        // worker inserted the same (name, city) first.
        let restaurant = self
            .store
            .create_restaurant(NewRestaurant {
                name: extraction.name.clone(),
                city: extraction.city.clone(),
                latitude: details.latitude,
                longitude: details.longitude,
                price_range: details.price_range,
                place_id: details.place_id,
            })
            .await?;

        Ok(restaurant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn resolver(db: PgPool) -> Resolver {
        Resolver::new(Store::new_from_pool(db), Arc::new(StaticPlaceLookup))
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_resolve_creates_on_first_sight(db: PgPool) {
        let resolver = resolver(db);
        let extraction = Extraction {
            name: "Sushi Nakazawa".to_owned(),
            city: "Tokyo".to_owned(),
        };

        let restaurant = resolver.resolve(&extraction).await.unwrap();

        assert_eq!(restaurant.name, "Sushi Nakazawa");
        assert_eq!(restaurant.city, "Tokyo");
        assert_eq!(restaurant.latitude, 40.7128);
        assert_eq!(restaurant.longitude, -74.0060);
        assert_eq!(restaurant.price_range.as_deref(), Some("$$"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_resolve_is_idempotent(db: PgPool) {
        let resolver = resolver(db);
        let extraction = Extraction {
            name: "Joe's Pizza".to_owned(),
            city: "New York".to_owned(),
        };

        let first = resolver.resolve(&extraction).await.unwrap();
        let second = resolver.resolve(&extraction).await.unwrap();

        assert_eq!(first.id, second.id);
    }

    struct FarawayLookup;

    #[async_trait]
    impl PlaceLookup for FarawayLookup {
        async fn lookup(&self, _name: &str, _city: &str) -> PlaceDetails {
            PlaceDetails {
                latitude: 35.6762,
                longitude: 139.6503,
                price_range: Some("$$$$".to_owned()),
                place_id: Some("place_777".to_owned()),
            }
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_resolve_uses_injected_provider(db: PgPool) {
        let resolver = Resolver::new(Store::new_from_pool(db), Arc::new(FarawayLookup));
        let extraction = Extraction {
            name: "Den".to_owned(),
            city: "Tokyo".to_owned(),
        };

        let restaurant = resolver.resolve(&extraction).await.unwrap();

        assert_eq!(restaurant.latitude, 35.6762);
        assert_eq!(restaurant.place_id.as_deref(), Some("place_777"));
    }
}
