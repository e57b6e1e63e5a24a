// Brand and technical-term extraction, and the additive score boost they
// drive. Everything here is pure and LLM-free by construction.

use lazy_static::lazy_static;
use regex::Regex;

use crate::domain::Record;

pub const BOOST_CAP: f64 = 0.15;
const BRAND_BOOST: f64 = 0.10;
const TECH_TERM_BOOST: f64 = 0.05;

lazy_static! {
    static ref UPPERCASE_CODE: Regex = Regex::new(r"\b[A-Z]{2,}[0-9]*\b").unwrap();
    static ref DASHED_CODE: Regex = Regex::new(r"\b[A-Z0-9]+-[A-Z0-9]+\b").unwrap();
    static ref NUMERIC_UNIT: Regex =
        Regex::new(r"\b\d+(?:W|V|A|Hz|mA|mm2|mm|kA)\b").unwrap();
    static ref POLE_TOKEN: Regex = Regex::new(r"\b(?:1P\+N|[1-4]P)\b").unwrap();
    static ref CURVE_TOKEN: Regex = Regex::new(r"(?i)\bcurva\s?[a-d]\b").unwrap();
}

/// Lowercases and strips diacritics so `"disyuntor"`/`"DISYUNTOR"` and
/// accented Spanish input normalize to the same token stream.
pub fn normalize_query(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect();
    folded.to_lowercase()
}

/// Extracts the technical-term classes directly from the *original-case*
/// utterance (the regexes depend on uppercase codes), not the normalized
/// lowercase query.
pub fn extract_technical_terms(raw_query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for re in [&*UPPERCASE_CODE, &*DASHED_CODE, &*NUMERIC_UNIT, &*POLE_TOKEN] {
        for m in re.find_iter(raw_query) {
            terms.push(m.as_str().to_string());
        }
    }
    for m in CURVE_TOKEN.find_iter(raw_query) {
        terms.push(m.as_str().to_string());
    }
    terms.sort();
    terms.dedup();
    terms
}

/// Case-insensitive, longest-match, word-boundary lookup of known brand
/// values against the normalized query.
pub fn extract_brand_tokens(normalized_query: &str, known_brands: &[String]) -> Vec<String> {
    let mut candidates: Vec<&String> = known_brands.iter().collect();
    candidates.sort_by_key(|b| std::cmp::Reverse(b.len()));

    let mut matched = Vec::new();
    for brand in candidates {
        let brand_lower = normalize_query(brand);
        if brand_lower.is_empty() {
            continue;
        }
        if word_boundary_contains(normalized_query, &brand_lower) {
            matched.push(brand.clone());
        }
    }
    matched
}

fn word_boundary_contains(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .map(|c| c.is_alphanumeric())
                .unwrap_or(false);
        let after = abs + needle.len();
        let after_ok = after == haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .map(|c| c.is_alphanumeric())
                .unwrap_or(false);
        if before_ok && after_ok {
            return true;
        }
        // Advance past the matched char's full byte length, not by one byte,
        // so `start` always lands on a char boundary even when the match
        // begins with a multibyte character (accented brand names).
        start = abs + haystack[abs..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

/// Additive boost for one record, capped at [`BOOST_CAP`].
pub fn boost_for(record: &Record, brand_tokens: &[String], technical_terms: &[String]) -> f64 {
    let mut boost = 0.0;

    if let Some(brand) = &record.brand {
        if brand_tokens
            .iter()
            .any(|token| token.eq_ignore_ascii_case(brand))
        {
            boost += BRAND_BOOST;
        }
    }

    let attribute_values: Vec<String> = record
        .attributes
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    for term in technical_terms {
        if attribute_values.iter().any(|v| v.eq_ignore_ascii_case(term)) {
            boost += TECH_TERM_BOOST;
        }
    }

    boost.min(BOOST_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_record(brand: &str, amperage: &str) -> Record {
        let mut attributes = BTreeMap::new();
        attributes.insert("amperage".to_string(), serde_json::json!(amperage));
        Record {
            id: "p1".to_string(),
            kind: crate::domain::RecordKind::Product,
            title: "Breaker".to_string(),
            body: "body".to_string(),
            url: None,
            brand: Some(brand.to_string()),
            attributes,
            content_hash: String::new(),
            dense_vector: None,
            lexical_text: String::new(),
            active: true,
            updated_at: chrono::Utc::now(),
            source_version: None,
        }
    }

    #[test]
    fn extracts_technical_term_classes() {
        let terms = extract_technical_terms("necesito un disyuntor 20A curva C 2P IEC60898");
        assert!(terms.iter().any(|t| t == "20A"));
        assert!(terms.iter().any(|t| t.eq_ignore_ascii_case("curva C")));
        assert!(terms.iter().any(|t| t == "2P"));
    }

    #[test]
    fn matches_longest_brand_first() {
        let brands = vec!["ABB".to_string(), "ABB Schneider".to_string()];
        let q = normalize_query("busco un disyuntor abb schneider 20a");
        let matched = extract_brand_tokens(&q, &brands);
        assert_eq!(matched[0], "ABB Schneider");
    }

    #[test]
    fn word_boundary_contains_advances_past_multibyte_match_without_panicking() {
        // "ñu" occurs inside "bañuelos" starting on the multibyte "ñ", but
        // embedded in an alphanumeric run so the word-boundary check fails
        // and the scan must continue. Advancing the cursor by one raw byte
        // (instead of the matched char's byte length) would land mid-"ñ"
        // and panic on the next slice; this must return cleanly instead.
        assert!(!word_boundary_contains("bañuelos", "ñu"));
    }

    #[test]
    fn word_boundary_contains_finds_multibyte_needle_after_a_non_boundary_hit() {
        // Same non-boundary first hit as above, followed by a real,
        // word-bounded occurrence later in the haystack.
        assert!(word_boundary_contains("bañuelos ñu", "ñu"));
    }

    #[test]
    fn boost_caps_at_point_one_five() {
        let record = sample_record("Schneider", "20A");
        let brand_tokens = vec!["Schneider".to_string()];
        let technical_terms = vec!["20A".to_string(), "curva C".to_string(), "2P".to_string()];
        let boost = boost_for(&record, &brand_tokens, &technical_terms);
        assert!((boost - BOOST_CAP).abs() < 1e-9);
    }
}
