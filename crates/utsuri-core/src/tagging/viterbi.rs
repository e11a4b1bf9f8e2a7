//! # Viterbi Decoding for CRF
//!
//! Implements the Viterbi algorithm for finding the most likely tag sequence
//! given emission scores and transition scores.

use crate::error::{Result, UtsuriError};

/// Viterbi decoder for CRF tag sequences.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
}

/// Path score and backpointer for Viterbi decoding.
#[derive(Debug, Clone, Copy)]
struct PathState {
    score: f32,
    prev_tag: Option<usize>,
}

impl ViterbiDecoder {
    /// Create a new Viterbi decoder.
    ///
    /// # Arguments
    /// * `num_tags` - Number of distinct tags
    pub fn new(num_tags: usize) -> Self {
        Self { num_tags }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Decode the optimal tag sequence using Viterbi algorithm.
    ///
    /// # Arguments
    /// * `emission_scores` - Matrix of shape [seq_len, num_tags] with emission scores
    /// * `transition_matrix` - Matrix of shape [num_tags, num_tags]; `[prev][curr]`
    ///
    /// # Returns
    /// The optimal tag sequence as indices.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<Vec<usize>> {
        let allow_all = vec![vec![true; self.num_tags]; self.num_tags];
        self.decode_constrained(emission_scores, transition_matrix, &allow_all)
    }

    /// Decode with hard constraints: `valid[prev][curr] == false` transitions
    /// are never taken.
    pub fn decode_constrained(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
        valid: &[Vec<bool>],
    ) -> Result<Vec<usize>> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }
        self.check_dims(emission_scores, transition_matrix, valid)?;

        // Initialize DP table: [seq_len][num_tags]
        let mut dp = vec![
            vec![
                PathState {
                    score: f32::NEG_INFINITY,
                    prev_tag: None,
                };
                self.num_tags
            ];
            seq_len
        ];

        for tag in 0..self.num_tags {
            dp[0][tag].score = emission_scores[0][tag];
        }

        // Forward pass
        for pos in 1..seq_len {
            for curr_tag in 0..self.num_tags {
                let mut best_score = f32::NEG_INFINITY;
                let mut best_prev = None;

                for prev_tag in 0..self.num_tags {
                    if !valid[prev_tag][curr_tag] {
                        continue;
                    }

                    let score = dp[pos - 1][prev_tag].score
                        + transition_matrix[prev_tag][curr_tag]
                        + emission_scores[pos][curr_tag];

                    if score > best_score {
                        best_score = score;
                        best_prev = Some(prev_tag);
                    }
                }

                dp[pos][curr_tag] = PathState {
                    score: best_score,
                    prev_tag: best_prev,
                };
            }
        }

        // Find best final tag
        let mut best_final_tag = 0;
        let mut best_final_score = f32::NEG_INFINITY;
        for tag in 0..self.num_tags {
            if dp[seq_len - 1][tag].score > best_final_score {
                best_final_score = dp[seq_len - 1][tag].score;
                best_final_tag = tag;
            }
        }

        // Backtrack
        let mut path = Vec::with_capacity(seq_len);
        path.push(best_final_tag);
        let mut curr_tag = best_final_tag;

        for pos in (1..seq_len).rev() {
            curr_tag = dp[pos][curr_tag].prev_tag.unwrap_or(0);
            path.push(curr_tag);
        }

        path.reverse();
        Ok(path)
    }

    fn check_dims(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
        valid: &[Vec<bool>],
    ) -> Result<()> {
        if let Some(row) = emission_scores.iter().find(|r| r.len() != self.num_tags) {
            return Err(UtsuriError::Configuration(format!(
                "emission score dimension mismatch: expected {}, got {}",
                self.num_tags,
                row.len()
            )));
        }
        let n = self.num_tags;
        let transitions_ok =
            transition_matrix.len() == n && transition_matrix.iter().all(|r| r.len() == n);
        let mask_ok = valid.len() == n && valid.iter().all(|r| r.len() == n);
        if !transitions_ok || !mask_ok {
            return Err(UtsuriError::Configuration(format!(
                "transition matrix must be {n}x{n}",
                n = self.num_tags
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagging::tags::TagVocab;

    fn vocab() -> TagVocab {
        TagVocab::new(["O", "B-PER", "I-PER", "B-LOC", "I-LOC"])
    }

    #[test]
    fn test_viterbi_simple() {
        let decoder = ViterbiDecoder::new(3);
        let transitions = vec![vec![0.0; 3]; 3];
        let emissions = vec![vec![0.1, 0.8, 0.1], vec![0.8, 0.1, 0.1]];

        let path = decoder.decode(&emissions, &transitions).unwrap();
        assert_eq!(path, vec![1, 0]);
    }

    #[test]
    fn test_viterbi_transitions_override_emissions() {
        let decoder = ViterbiDecoder::new(2);
        // Staying on tag 0 is heavily rewarded.
        let transitions = vec![vec![5.0, 0.0], vec![0.0, 0.0]];
        let emissions = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        let path = decoder.decode(&emissions, &transitions).unwrap();
        assert_eq!(path, vec![0, 0]);
    }

    #[test]
    fn test_viterbi_empty() {
        let decoder = ViterbiDecoder::new(5);
        let transitions = vec![vec![0.0; 5]; 5];
        let emissions: Vec<Vec<f32>> = vec![];

        let result = decoder.decode(&emissions, &transitions).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_decode_constrained_avoids_invalid_transition() {
        let v = vocab();
        let decoder = ViterbiDecoder::new(v.len());
        let transitions = vec![vec![0.0; v.len()]; v.len()];
        // Position 0 prefers O, position 1 prefers I-PER; O -> I-PER is invalid.
        let emissions = vec![
            vec![2.0, 1.5, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 3.0, 0.0, 0.0],
        ];

        let unconstrained = decoder.decode(&emissions, &transitions).unwrap();
        assert_eq!(unconstrained, vec![0, 2]);

        let constrained = decoder
            .decode_constrained(&emissions, &transitions, &v.transition_mask())
            .unwrap();
        assert_eq!(constrained, vec![1, 2]);
    }

    #[test]
    fn test_decode_constrained_io_scheme_matches_unconstrained() {
        let transitions = vec![vec![0.0; 2]; 2];
        let emissions = vec![vec![5.0, 0.0], vec![0.0, 5.0]];
        for names in [["O", "I-PER"], ["O", "PER"]] {
            let v = TagVocab::new(names);
            let decoder = ViterbiDecoder::new(v.len());
            let path = decoder
                .decode_constrained(&emissions, &transitions, &v.transition_mask())
                .unwrap();
            assert_eq!(path, vec![0, 1]);
            assert_eq!(path, decoder.decode(&emissions, &transitions).unwrap());
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let decoder = ViterbiDecoder::new(3);
        let transitions = vec![vec![0.0; 3]; 3];
        let emissions = vec![vec![0.0; 2]];
        assert!(decoder.decode(&emissions, &transitions).is_err());
    }
}
