//! Utility functions for identifiers, timestamps and name validation.

pub mod timestamps;
mod validation;

pub use timestamps::{backup_filename, iso_timestamp, now_utc, Timestamp};
pub use validation::{validate_archive_filename, validate_database_name};

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_is_valid() {
        let id = generate_uuid();
        assert_eq!(id.get_version_num(), 4);
    }
}
