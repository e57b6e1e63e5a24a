// src/domain.rs
// Shared domain types: the unified Record content unit and small value types
// that cross module boundaries (catalog, knowledge, index, retrieval).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Product,
    Category,
    Knowledge,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Product => "product",
            RecordKind::Category => "category",
            RecordKind::Knowledge => "knowledge",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(RecordKind::Product),
            "category" => Ok(RecordKind::Category),
            "knowledge" => Ok(RecordKind::Knowledge),
            other => anyhow::bail!("unknown record kind: {other}"),
        }
    }
}

/// The unified content unit persisted by the Index Store: a product, a
/// category, or a knowledge-base entry. Attribute values are kept as JSON so
/// that schema-less catalog attributes round-trip without a migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub brand: Option<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub content_hash: String,
    pub dense_vector: Option<Vec<f32>>,
    pub lexical_text: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
    pub source_version: Option<String>,
}

impl Record {
    /// Normalizes title/body/attributes and computes the content hash used
    /// for change detection. Must be called whenever any indexed field
    /// changes; the Sync Engine relies on this to skip unchanged records.
    pub fn with_recomputed_hash(mut self) -> Self {
        self.content_hash = compute_content_hash(&self.title, &self.body, &self.attributes);
        self.lexical_text = build_lexical_text(&self.title, &self.body, &self.attributes);
        self
    }

    pub fn attribute_str(&self, key: &str) -> Option<String> {
        self.attributes.get(key).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

/// Strips the tags a storefront CMS commonly emits and collapses runs of
/// whitespace, so unrelated formatting churn doesn't change the hash.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            c => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn compute_content_hash(
    title: &str,
    body: &str,
    attributes: &BTreeMap<String, serde_json::Value>,
) -> String {
    let normalized_title = normalize_text(title);
    let normalized_body = normalize_text(body);
    // BTreeMap iterates in key order, so serialization is stable regardless
    // of insertion order upstream.
    let attrs_json = serde_json::to_string(attributes).unwrap_or_default();
    let combined = format!("{normalized_title}\u{1}{normalized_body}\u{1}{attrs_json}");
    crate::utils::sha256_hash(&combined)
}

/// Builds the lexical index text with the weighting the spec requires:
/// title highest, attributes next, body last. FTS5's bm25 already favors
/// earlier/denser term occurrence, so repeating the title gives it extra
/// implicit weight without a custom ranking function.
fn build_lexical_text(
    title: &str,
    body: &str,
    attributes: &BTreeMap<String, serde_json::Value>,
) -> String {
    let attr_text = attributes
        .values()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{title} {title} {attr_text} {body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_equivalent_content() {
        let mut attrs = BTreeMap::new();
        attrs.insert("brand".to_string(), serde_json::json!("Schneider"));
        let h1 = compute_content_hash("  Title  ", "Body  text", &attrs);
        let h2 = compute_content_hash("Title", "Body text", &attrs);
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_changes_with_attributes() {
        let mut attrs = BTreeMap::new();
        attrs.insert("price".to_string(), serde_json::json!(10));
        let h1 = compute_content_hash("Title", "Body", &attrs);
        attrs.insert("price".to_string(), serde_json::json!(12));
        let h2 = compute_content_hash("Title", "Body", &attrs);
        assert_ne!(h1, h2);
    }
}
