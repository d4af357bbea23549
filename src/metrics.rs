//! Reconstruction quality metrics on token ids.

use std::collections::HashMap;

use crate::data::PAD_ID;

/// ROUGE-n F1 between `reference` and `candidate`, ignoring padding.
///
/// Overlap is the clipped count of shared n-grams. Returns 0 when either
/// side has no n-gram of length `n`.
pub fn rouge_n(reference: &[u32], candidate: &[u32], n: usize) -> f64 {
    let reference = ngrams(reference, n);
    let candidate = ngrams(candidate, n);
    let ref_total: usize = reference.values().sum();
    let cand_total: usize = candidate.values().sum();
    if ref_total == 0 || cand_total == 0 {
        return 0.0;
    }

    let overlap: usize = candidate
        .iter()
        .map(|(gram, &count)| count.min(reference.get(gram).copied().unwrap_or(0)))
        .sum();
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / cand_total as f64;
    let recall = overlap as f64 / ref_total as f64;
    2.0 * precision * recall / (precision + recall)
}

fn ngrams(ids: &[u32], n: usize) -> HashMap<Vec<u32>, usize> {
    let mut counts = HashMap::new();
    if n == 0 {
        return counts;
    }
    let words: Vec<u32> = ids.iter().copied().filter(|&id| id != PAD_ID).collect();
    for window in words.windows(n) {
        *counts.entry(window.to_vec()).or_insert(0) += 1;
    }
    counts
}

/// Running mean of ROUGE-1 and ROUGE-2 over many sentence pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RougeAccumulator {
    rouge1: f64,
    rouge2: f64,
    count: usize,
}

impl RougeAccumulator {
    pub fn add(&mut self, reference: &[u32], candidate: &[u32]) {
        self.rouge1 += rouge_n(reference, candidate, 1);
        self.rouge2 += rouge_n(reference, candidate, 2);
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `(rouge1, rouge2)` means, zero if nothing was added.
    pub fn mean(&self) -> (f64, f64) {
        if self.count == 0 {
            return (0.0, 0.0);
        }
        let n = self.count as f64;
        (self.rouge1 / n, self.rouge2 / n)
    }
}
