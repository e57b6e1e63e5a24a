// src/catalog/taxonomy.rs
// Category taxonomy mapping applied during Sync Engine normalization
// (spec.md §4.5 step 4: "apply taxonomy mapping"). Per the Design Notes'
// redesign flag, this replaces scattered hardcoded synonym lists with one
// data file loaded at start.

use std::collections::HashMap;
use tracing::{info, warn};

/// Maps a raw upstream category/synonym string (case-insensitive) to the
/// canonical category name used across the index. Missing entries pass
/// through unchanged.
#[derive(Debug, Clone, Default)]
pub struct TaxonomyMap {
    canonical_by_synonym: HashMap<String, String>,
}

impl TaxonomyMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads `synonym = canonical` pairs from `path`, one per line (`#`
    /// comments and blank lines ignored). A missing file yields an empty map
    /// (pure passthrough), logged at `warn`.
    pub fn load(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path, error = %e, "taxonomy mapping file unreadable, using passthrough");
                return Self::empty();
            }
        };

        let mut map = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((synonym, canonical)) = line.split_once('=') else {
                continue;
            };
            map.insert(synonym.trim().to_lowercase(), canonical.trim().to_string());
        }
        info!(path, count = map.len(), "loaded taxonomy mapping");
        Self { canonical_by_synonym: map }
    }

    pub fn canonicalize(&self, raw: &str) -> String {
        self.canonical_by_synonym
            .get(&raw.to_lowercase())
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    /// Rewrites `record.attributes["category"]` in place through the map,
    /// if present and a string.
    pub fn apply(&self, record: &mut crate::domain::Record) {
        if let Some(serde_json::Value::String(category)) = record.attributes.get("category").cloned() {
            let canonical = self.canonicalize(&category);
            record
                .attributes
                .insert("category".to_string(), serde_json::Value::String(canonical));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unmapped_category_passes_through() {
        let map = TaxonomyMap::empty();
        assert_eq!(map.canonicalize("Disyuntores"), "Disyuntores");
    }

    #[test]
    fn loads_and_applies_mapping_case_insensitively() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "disyuntores = circuit_breakers").unwrap();
        writeln!(file, "# comment line").unwrap();
        writeln!(file, "breakers = circuit_breakers").unwrap();
        let map = TaxonomyMap::load(file.path().to_str().unwrap());

        assert_eq!(map.canonicalize("DISYUNTORES"), "circuit_breakers");
        assert_eq!(map.canonicalize("unknown"), "unknown");
    }
}
