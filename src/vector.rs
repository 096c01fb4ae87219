// Embedding vector storage and math.
//
// Vectors are stored as little-endian f32 BLOBs. Every vector written to the
// database is L2-normalised first, so cosine similarity reduces to a dot
// product at query time.

use crate::error::{OtError, Result};

/// Encode a vector as a little-endian f32 blob for storage.
pub fn encode_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a stored blob back into a vector. Fails on truncated blobs.
pub fn decode_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(OtError::Internal(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// L2-normalise in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of two vectors of arbitrary norm.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot(a, b) / (na * nb)
}

/// Mean-pool a set of equal-length vectors, then L2-normalise the result.
pub fn mean_pool(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    let mut acc = vec![0.0f32; dim];
    for v in vectors {
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    l2_normalize(&mut acc);
    Some(acc)
}

/// Keeps the K highest-scoring items seen so far.
pub struct TopK<T> {
    k: usize,
    items: Vec<(f32, T)>,
}

impl<T> TopK<T> {
    pub fn new(k: usize) -> Self {
        TopK {
            k,
            items: Vec::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, score: f32, item: T) {
        if self.items.len() == self.k {
            // Cheap reject against the current minimum
            if let Some(min) = self
                .items
                .iter()
                .map(|(s, _)| *s)
                .fold(None::<f32>, |acc, s| Some(acc.map_or(s, |m| m.min(s))))
            {
                if score <= min {
                    return;
                }
            }
        }
        self.items.push((score, item));
        if self.items.len() > self.k {
            // Drop the single worst item
            let (worst_idx, _) = self
                .items
                .iter()
                .enumerate()
                .min_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(std::cmp::Ordering::Equal))
                .unwrap();
            self.items.swap_remove(worst_idx);
        }
    }

    /// Drain into a score-descending vector.
    pub fn into_sorted(mut self) -> Vec<(f32, T)> {
        self.items
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.125, 0.0];
        let blob = encode_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(decode_blob(&blob).unwrap(), v);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        assert!(decode_blob(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_normalize_unit_norm() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_normalized() {
        let pooled = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((pooled[0] - pooled[1]).abs() < 1e-6);
    }

    #[test]
    fn test_topk_keeps_highest() {
        let mut top = TopK::new(3);
        for (i, score) in [0.1f32, 0.9, 0.5, 0.7, 0.3].iter().enumerate() {
            top.push(*score, i);
        }
        let sorted = top.into_sorted();
        let ids: Vec<usize> = sorted.iter().map(|(_, i)| *i).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn test_cosine_identical_vectors() {
        let a = vec![0.2f32, 0.4, 0.8];
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-6);
    }
}
