//! Domain types shared by the producer and the worker.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of parsing errors for domain types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid SaveEventStatus")]
    ParseSaveEventStatusError(String),
    #[error("{0} is not a valid SaveFlag")]
    ParseSaveFlagError(String),
}

/// Processing state of a `SaveEvent`.
///
/// The only legal path is pending -> processing -> {complete, failed}.
/// Complete and failed are terminal; a queue redelivery re-enters at
/// processing, so processing -> processing is a permitted no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "save_event_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SaveEventStatus {
    /// Persisted by the producer, not yet picked up by a worker.
    Pending,
    /// Picked up by a worker; extraction/resolution/finalization in flight.
    Processing,
    /// Terminal: the user-restaurant link exists (or already existed).
    Complete,
    /// Terminal: unrecoverable error, `error_message` is populated.
    Failed,
}

impl SaveEventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SaveEventStatus::Complete | SaveEventStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition(&self, next: SaveEventStatus) -> bool {
        match (self, next) {
            (SaveEventStatus::Pending, SaveEventStatus::Processing) => true,
            (SaveEventStatus::Processing, SaveEventStatus::Processing) => true,
            (SaveEventStatus::Processing, SaveEventStatus::Complete) => true,
            (SaveEventStatus::Processing, SaveEventStatus::Failed) => true,
            (SaveEventStatus::Processing, SaveEventStatus::Pending) => false,
            (SaveEventStatus::Pending, _) => false,
            (SaveEventStatus::Complete, _) => false,
            (SaveEventStatus::Failed, _) => false,
        }
    }
}

impl fmt::Display for SaveEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveEventStatus::Pending => write!(f, "pending"),
            SaveEventStatus::Processing => write!(f, "processing"),
            SaveEventStatus::Complete => write!(f, "complete"),
            SaveEventStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Allow casting SaveEventStatus from strings.
impl FromStr for SaveEventStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SaveEventStatus::Pending),
            "processing" => Ok(SaveEventStatus::Processing),
            "complete" => Ok(SaveEventStatus::Complete),
            "failed" => Ok(SaveEventStatus::Failed),
            invalid => Err(ParseError::ParseSaveEventStatusError(invalid.to_owned())),
        }
    }
}

/// The closed set of toggleable boolean fields on a saved restaurant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveFlag {
    Favorite,
    Visited,
}

impl SaveFlag {
    /// The `user_restaurants` column this flag toggles.
    pub fn column(&self) -> &'static str {
        match self {
            SaveFlag::Favorite => "is_favorite",
            SaveFlag::Visited => "is_visited",
        }
    }

    /// The system-managed list name historically paired with this flag.
    pub fn reserved_list_name(&self) -> &'static str {
        match self {
            SaveFlag::Favorite => "Favorites",
            SaveFlag::Visited => "Visited",
        }
    }
}

impl FromStr for SaveFlag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "favorite" => Ok(SaveFlag::Favorite),
            "visited" => Ok(SaveFlag::Visited),
            invalid => Err(ParseError::ParseSaveFlagError(invalid.to_owned())),
        }
    }
}

/// List names managed by the system. Users cannot create or delete lists
/// with these names through the normal list endpoints.
pub const RESERVED_LIST_NAMES: [&str; 2] = ["Favorites", "Visited"];

/// Reserved-name comparison is trimmed and case-insensitive, matching the
/// per-user uniqueness rule on list names.
pub fn is_reserved_list_name(name: &str) -> bool {
    let trimmed = name.trim();
    RESERVED_LIST_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use SaveEventStatus::{Complete, Failed, Pending, Processing};

        assert!(Pending.can_transition(Processing));
        assert!(Processing.can_transition(Complete));
        assert!(Processing.can_transition(Failed));
        // Redelivery re-enters processing.
        assert!(Processing.can_transition(Processing));

        // No skipping processing.
        assert!(!Pending.can_transition(Complete));
        assert!(!Pending.can_transition(Failed));

        // Terminal states are never left.
        for terminal in [Complete, Failed] {
            for next in [Pending, Processing, Complete, Failed] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SaveEventStatus::Pending,
            SaveEventStatus::Processing,
            SaveEventStatus::Complete,
            SaveEventStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<SaveEventStatus>(), Ok(status));
        }

        assert!("finished".parse::<SaveEventStatus>().is_err());
    }

    #[test]
    fn test_reserved_list_names() {
        assert!(is_reserved_list_name("Favorites"));
        assert!(is_reserved_list_name("visited"));
        assert!(is_reserved_list_name("  FAVORITES  "));
        assert!(!is_reserved_list_name("Date night"));
        assert!(!is_reserved_list_name("Favorites!"));
    }

    #[test]
    fn test_flag_columns() {
        assert_eq!(SaveFlag::Favorite.column(), "is_favorite");
        assert_eq!(SaveFlag::Visited.column(), "is_visited");
        assert_eq!("favorite".parse::<SaveFlag>(), Ok(SaveFlag::Favorite));
        assert!("liked".parse::<SaveFlag>().is_err());
    }
}
