//! Validation of user-supplied names.

use crate::errors::{DumpflowError, Result};
use regex::Regex;
use std::sync::OnceLock;

fn database_name_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,62}$").ok())
        .as_ref()
        .ok_or_else(|| DumpflowError::Internal("database name pattern failed to compile".to_string()))
}

/// Checks that a database name is safe as an SQL identifier and path component.
pub fn validate_database_name(name: &str) -> Result<()> {
    if database_name_pattern()?.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(DumpflowError::InvalidRequest(format!(
            "invalid database name '{name}'"
        )))
    }
}

/// Checks that an archive file name refers to a plain file directly under the input root.
pub fn validate_archive_filename(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        Err(DumpflowError::InvalidRequest(format!(
            "invalid archive file name '{name}'"
        )))
    } else {
        Ok(())
    }
}
