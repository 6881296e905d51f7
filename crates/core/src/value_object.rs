//! Value objects: equality by value, not identity.
//!
//! Value objects have **no identity**. Two value objects with the same values
//! are the same value, and they are immutable once constructed.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects.
///
/// The trait requires:
/// - **Clone**: values are cheap to copy
/// - **PartialEq**: values are compared by their attributes
/// - **Debug**: values show up in logs and test failures
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Maximum accepted length of a location name.
pub const MAX_LOCATION_LEN: usize = 128;

/// A physical location (room, bay, vault) inside the facility.
///
/// Well-formed means: non-empty, no leading/trailing whitespace, no control
/// characters, at most [`MAX_LOCATION_LEN`] characters. Location comparison is
/// exact, which is what the move compare-and-swap relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location(String);

impl ValueObject for Location {}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        if raw.trim().is_empty() {
            return Err(DomainError::validation("location cannot be empty"));
        }
        if raw.trim() != raw {
            return Err(DomainError::validation(
                "location cannot have leading or trailing whitespace",
            ));
        }
        if raw.chars().count() > MAX_LOCATION_LEN {
            return Err(DomainError::validation(format!(
                "location longer than {MAX_LOCATION_LEN} characters"
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "location cannot contain control characters",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Location {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Location> for String {
    fn from(value: Location) -> Self {
        value.0
    }
}
