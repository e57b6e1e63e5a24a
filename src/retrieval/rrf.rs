// Reciprocal Rank Fusion over two ranked id lists.

use std::collections::HashMap;

/// `rrf(id) = w_v/(K + rank_V(id)) + w_t/(K + rank_T(id))`. Ranks are 1-based;
/// an id absent from a leg contributes zero for that leg.
pub fn fuse(
    vector_ranked: &[(String, f32)],
    text_ranked: &[(String, f32)],
    k: f64,
    weight_vector: f64,
    weight_text: f64,
) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    for (rank, (id, _)) in vector_ranked.iter().enumerate() {
        let contribution = weight_vector / (k + (rank + 1) as f64);
        *scores.entry(id.clone()).or_insert(0.0) += contribution;
    }
    for (rank, (id, _)) in text_ranked.iter().enumerate() {
        let contribution = weight_text / (k + (rank + 1) as f64);
        *scores.entry(id.clone()).or_insert(0.0) += contribution;
    }

    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuses_ranks_from_both_legs() {
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let text = vec![("b".to_string(), 10.0), ("c".to_string(), 8.0)];
        let fused = fuse(&vector, &text, 60.0, 0.6, 0.4);

        let a = fused["a"];
        let b = fused["b"];
        let c = fused["c"];
        assert!(b > a, "b appears in both legs so should outrank a-only");
        assert!(b > c, "b ranks 1st in text vs c's 2nd");
    }

    #[test]
    fn absent_ids_contribute_nothing() {
        let vector = vec![("a".to_string(), 0.9)];
        let text: Vec<(String, f32)> = vec![];
        let fused = fuse(&vector, &text, 60.0, 0.6, 0.4);
        assert_eq!(fused.len(), 1);
        assert!((fused["a"] - 0.6 / 61.0).abs() < 1e-9);
    }
}
