//! Timestamp helpers.

use chrono::{DateTime, Local, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Format of the timestamp suffix in backup file names.
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M";

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// # Examples
///
/// ```
/// use dumpflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Builds the base name of a backup archive, `<db>_<YYYYMMDD_HHMM>`.
///
/// Uses local time so operators see the wall-clock time of the backup.
#[must_use]
pub fn backup_filename(database_name: &str) -> String {
    backup_filename_at(database_name, &Local::now())
}

/// Same as [`backup_filename`] with an explicit clock reading.
#[must_use]
pub fn backup_filename_at<Tz>(database_name: &str, at: &DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{database_name}_{}", at.format(FILENAME_TIMESTAMP_FORMAT))
}
