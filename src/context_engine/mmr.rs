// src/context_engine/mmr.rs
//! Greedy Maximal Marginal Relevance selection for context packing.
//!
//! A naive single-pass weighted sum with a threshold cut never considers how
//! similar a candidate is to items already picked, so redundant near-
//! duplicates crowd out diverse context. This module follows a
//! candidate-then-select architecture with a per-item `mmr_score` field and
//! budget capping, implementing the greedy MMR definition directly: pick =
//! argmax_i [ mu*relevance_i - (1-mu)*max_{j in selected} sim(i,j) ].

#[derive(Debug, Clone)]
pub struct MmrCandidate {
    pub id: String,
    pub relevance: f32,
    pub embedding: Vec<f32>,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub struct MmrPick {
    pub id: String,
    pub mmr_score: f32,
}

/// Greedy MMR under a hard token budget. `mu` trades off relevance
/// (mu -> 1) against diversity (mu -> 0); default is 0.3.
pub fn select_with_mmr(candidates: &[MmrCandidate], mu: f32, token_budget: usize) -> Vec<MmrPick> {
    let mut remaining: Vec<&MmrCandidate> = candidates.iter().collect();
    let mut selected: Vec<&MmrCandidate> = Vec::new();
    let mut picks = Vec::new();
    let mut used_tokens = 0usize;

    while !remaining.is_empty() {
        let mut best_idx = None;
        let mut best_score = f32::NEG_INFINITY;

        for (idx, candidate) in remaining.iter().enumerate() {
            if used_tokens + candidate.tokens > token_budget {
                continue;
            }
            let max_sim = selected
                .iter()
                .map(|s| cosine_similarity(&candidate.embedding, &s.embedding))
                .fold(0.0_f32, f32::max);
            let score = mu * candidate.relevance - (1.0 - mu) * max_sim;
            if score > best_score {
                best_score = score;
                best_idx = Some(idx);
            }
        }

        if best_score < 0.0 {
            break;
        }

        match best_idx {
            Some(idx) => {
                let candidate = remaining.remove(idx);
                used_tokens += candidate.tokens;
                picks.push(MmrPick {
                    id: candidate.id.clone(),
                    mmr_score: best_score,
                });
                selected.push(candidate);
            }
            None => break,
        }
    }

    picks
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// `exp(-lambda * age_days)`, an exponential decay scorer re-parameterized
/// to a day timescale (lambda default 0.03).
pub fn recency_decay(age_days: f32, lambda: f32) -> f32 {
    (-lambda * age_days).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, relevance: f32, embedding: Vec<f32>, tokens: usize) -> MmrCandidate {
        MmrCandidate { id: id.to_string(), relevance, embedding, tokens }
    }

    #[test]
    fn prefers_diverse_candidates_over_redundant_ones() {
        let candidates = vec![
            candidate("a", 0.9, vec![1.0, 0.0], 10),
            candidate("b", 0.89, vec![1.0, 0.0], 10), // near-duplicate of a
            candidate("c", 0.5, vec![0.0, 1.0], 10),  // orthogonal, lower relevance
        ];
        let picks = select_with_mmr(&candidates, 0.5, 30);
        let ids: Vec<&str> = picks.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids[0], "a");
        // c should beat b for second slot: diversity penalty on b is large.
        assert_eq!(ids[1], "c");
    }

    #[test]
    fn respects_token_budget() {
        let candidates = vec![
            candidate("a", 0.9, vec![1.0, 0.0], 50),
            candidate("b", 0.8, vec![0.0, 1.0], 60),
        ];
        let picks = select_with_mmr(&candidates, 0.5, 50);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].id, "a");
    }

    #[test]
    fn stops_once_marginal_score_goes_negative() {
        // b is redundant with a and not relevant enough to survive the
        // diversity penalty: mu*relevance - (1-mu)*max_sim < 0.
        let candidates = vec![
            candidate("a", 0.9, vec![1.0, 0.0], 10),
            candidate("b", 0.1, vec![1.0, 0.0], 10),
        ];
        let picks = select_with_mmr(&candidates, 0.3, 1000);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].id, "a");
    }

    #[test]
    fn recency_decay_is_monotonically_decreasing() {
        assert!(recency_decay(0.0, 0.03) > recency_decay(10.0, 0.03));
        assert!((recency_decay(0.0, 0.03) - 1.0).abs() < 1e-6);
    }
}
