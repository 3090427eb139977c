//! The `manifest.json` written next to every dump.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Describes the database a dump was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format marker, always `"1"`.
    pub odoo_dump: String,
    /// Source database.
    pub db_name: String,
    /// Application version guessed from the installed modules.
    pub version: String,
    /// Same as `version`.
    pub version_info: String,
    /// Same as `version`.
    pub major_version: String,
    /// Server version, `major.minor`.
    pub pg_version: String,
    /// Installed module name to latest version.
    pub modules: BTreeMap<String, String>,
}

impl Manifest {
    /// Builds a manifest, deriving the version fields from `modules`.
    #[must_use]
    pub fn new(db_name: impl Into<String>, pg_version: impl Into<String>, modules: BTreeMap<String, String>) -> Self {
        let version = guess_version(&modules);
        Self {
            odoo_dump: "1".to_string(),
            db_name: db_name.into(),
            version_info: version.clone(),
            major_version: version.clone(),
            version,
            pg_version: pg_version.into(),
            modules,
        }
    }
}

/// `"14.0.1.3"` on the first module gives `"14.0"`; anything unparsable gives `""`.
#[must_use]
pub fn guess_version(modules: &BTreeMap<String, String>) -> String {
    modules
        .values()
        .next()
        .and_then(|v| v.split('.').next())
        .and_then(|major| major.trim().parse::<u32>().ok())
        .map(|major| format!("{major}.0"))
        .unwrap_or_default()
}

/// Renders `server_version_num` (e.g. `140005`) as `major.minor` (`"14.0"`).
#[must_use]
pub fn pg_version_from_num(server_version_num: u32) -> String {
    format!("{}.{}", server_version_num / 10_000, (server_version_num / 100) % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_guess_version_from_first_module() {
        assert_eq!(guess_version(&modules(&[("base", "16.0.1.3"), ("web", "16.0.1.0")])), "16.0");
        assert_eq!(guess_version(&modules(&[("base", "saas~17.1")])), "");
        assert_eq!(guess_version(&BTreeMap::new()), "");
    }

    #[test]
    fn test_pg_version_from_num() {
        assert_eq!(pg_version_from_num(140_005), "14.0");
        assert_eq!(pg_version_from_num(90_624), "9.6");
    }

    #[test]
    fn test_manifest_serializes_expected_keys() {
        let manifest = Manifest::new("acme", "15.2", modules(&[("base", "15.0.1.3")]));
        let value = serde_json::to_value(&manifest).unwrap();

        assert_eq!(value["odoo_dump"], "1");
        assert_eq!(value["db_name"], "acme");
        assert_eq!(value["major_version"], "15.0");
        assert_eq!(value["modules"]["base"], "15.0.1.3");
    }
}
