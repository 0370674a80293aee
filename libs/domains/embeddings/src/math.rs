//! Vector arithmetic shared by the blend, the store checks, and search.

use sha2::{Digest, Sha256};

pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// `dot(a, b) / (|a| * |b|)`. A zero-magnitude input, or inputs of different
/// lengths, score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = magnitude(a) * magnitude(b);
    if norm == 0.0 || !norm.is_finite() {
        return 0.0;
    }
    dot / norm
}

/// Scale to unit length. Returns `None` for a zero or non-finite vector.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = magnitude(v);
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Uniformly random direction on the unit sphere.
pub fn random_unit_vector(dimension: usize) -> Vec<f32> {
    loop {
        // Symmetric components, resampled in the vanishing case of all zeros
        let raw: Vec<f32> = (0..dimension)
            .map(|_| rand::random::<f32>() * 2.0 - 1.0)
            .collect();
        if dimension == 0 {
            return raw;
        }
        if let Some(unit) = normalize(&raw) {
            return unit;
        }
    }
}

/// Stable cache key for a similarity query.
pub fn fingerprint(query: &[f32], limit: usize, threshold: f32) -> String {
    let mut hasher = Sha256::new();
    for x in query {
        hasher.update(x.to_le_bytes());
    }
    hasher.update((limit as u64).to_le_bytes());
    hasher.update(threshold.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
