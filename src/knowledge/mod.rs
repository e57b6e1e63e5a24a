// src/knowledge/mod.rs
// Knowledge Loader (C6): parses a directory of front-matter-tagged Markdown
// files into one Record per top-level (`# Heading`) section and feeds
// reconciliation for `kind=knowledge`.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::domain::{Record, RecordKind};
use crate::embeddings::EmbeddingClient;
use crate::error::{EngineError, EngineResult};
use crate::index::IndexStore;

pub struct KnowledgeLoader {
    index: Arc<dyn IndexStore>,
    embeddings: Arc<dyn EmbeddingClient>,
}

impl KnowledgeLoader {
    pub fn new(index: Arc<dyn IndexStore>, embeddings: Arc<dyn EmbeddingClient>) -> Self {
        Self { index, embeddings }
    }

    /// Reloads every Markdown file under `dir`, reconciling against the
    /// existing `kind=knowledge` listing the same way the Sync Engine would:
    /// unchanged content hashes are skipped, stale ids are soft-deleted.
    pub async fn reload(&self, dir: &Path) -> EngineResult<usize> {
        let mut parsed = Vec::new();
        for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = match tokio::fs::read_to_string(path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read knowledge file");
                    continue;
                }
            };
            let file_stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            parsed.extend(parse_markdown(&file_stem, &content));
        }

        let existing = self.index.list_ids(RecordKind::Knowledge).await?;
        let seen_ids: std::collections::HashSet<String> =
            parsed.iter().map(|r| r.id.clone()).collect();

        let mut loaded = 0;
        let mut texts = Vec::new();
        let mut to_embed = Vec::new();
        for (i, record) in parsed.iter().enumerate() {
            let unchanged = existing
                .iter()
                .any(|(id, hash, active)| id == &record.id && hash == &record.content_hash && *active);
            if !unchanged {
                to_embed.push(i);
                texts.push(format!("{} {}", record.title, record.body));
            }
        }

        if !to_embed.is_empty() {
            let vectors = self.embeddings.embed(&texts).await?;
            for (slot, vector) in to_embed.iter().zip(vectors.into_iter()) {
                let mut record = parsed[*slot].clone();
                record.dense_vector = Some(vector);
                self.index.upsert(record).await?;
                loaded += 1;
            }
        }

        for (id, _, active) in &existing {
            if *active && !seen_ids.contains(id) {
                self.index.soft_delete(id).await?;
            }
        }

        info!(loaded, total_sections = parsed.len(), "knowledge base reloaded");
        Ok(loaded)
    }
}

fn slugify(heading: &str) -> String {
    heading
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Splits on top-level `# Heading` markers. A leading `---` front-matter
/// block, if present, supplies the `category` attribute for every section in
/// the file.
fn parse_markdown(file_stem: &str, content: &str) -> Vec<Record> {
    let (category, body) = split_front_matter(content);
    let mut records = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut current_body = String::new();
    let mut order = 0usize;

    let mut flush = |heading: &Option<String>, body: &str, order: usize, records: &mut Vec<Record>| {
        if let Some(heading) = heading {
            let mut attributes = BTreeMap::new();
            if let Some(cat) = &category {
                attributes.insert("category".to_string(), serde_json::json!(cat));
            }
            attributes.insert("file".to_string(), serde_json::json!(file_stem));
            attributes.insert("order".to_string(), serde_json::json!(order));

            let id = format!("kb:{}:{}", file_stem, slugify(heading));
            records.push(
                Record {
                    id,
                    kind: RecordKind::Knowledge,
                    title: heading.clone(),
                    body: body.trim().to_string(),
                    url: None,
                    brand: None,
                    attributes,
                    content_hash: String::new(),
                    dense_vector: None,
                    lexical_text: String::new(),
                    active: true,
                    updated_at: Utc::now(),
                    source_version: None,
                }
                .with_recomputed_hash(),
            );
        }
    };

    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            flush(&current_heading, &current_body, order, &mut records);
            if current_heading.is_some() {
                order += 1;
            }
            current_heading = Some(heading.trim().to_string());
            current_body.clear();
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    flush(&current_heading, &current_body, order, &mut records);

    records
}

fn split_front_matter(content: &str) -> (Option<String>, &str) {
    if let Some(rest) = content.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---\n") {
            let front = &rest[..end];
            let body = &rest[end + 5..];
            let category = front
                .lines()
                .find_map(|line| line.strip_prefix("category:"))
                .map(|v| v.trim().to_string());
            return (category, body);
        }
    }
    (None, content)
}

pub fn validate_dir_exists(dir: &Path) -> EngineResult<()> {
    if !dir.is_dir() {
        return Err(EngineError::invariant(format!(
            "knowledge directory {} does not exist",
            dir.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_record_per_heading() {
        let content = "---\ncategory: shipping\n---\n# Returns\nYou can return within 30 days.\n\n# Shipping times\nOrders ship within 2 days.\n";
        let records = parse_markdown("faq", content);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "kb:faq:returns");
        assert_eq!(records[0].attribute_str("category"), Some("shipping".to_string()));
        assert_eq!(records[1].title, "Shipping times");
    }

    #[test]
    fn handles_missing_front_matter() {
        let content = "# Just a heading\nSome body text.\n";
        let records = parse_markdown("plain", content);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attribute_str("category"), None);
    }
}
