use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
}

/// In-memory nearest-neighbor index over `{id -> vector}`. Exact scan; the
/// search contract (top-k by descending similarity) allows an approximate
/// implementation to be swapped in behind the same surface.
///
/// The configured dimension is fixed at construction; every `add`/`search`
/// vector is checked against it.
pub struct VectorIndex {
    dim: usize,
    metric: Metric,
    vectors: HashMap<u64, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            vectors: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn check_dim(&self, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Idempotent per id; a later add overwrites the stored vector.
    pub fn add(&mut self, id: u64, vector: Vec<f32>) -> Result<(), StoreError> {
        self.check_dim(&vector)?;
        self.vectors.insert(id, vector);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.vectors.remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.vectors.contains_key(&id)
    }

    /// Top-k by descending similarity, ties broken by ascending id so result
    /// order is deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>, StoreError> {
        self.check_dim(query)?;

        let mut scores: Vec<(u64, f32)> = self
            .vectors
            .iter()
            .map(|(id, vector)| (*id, self.similarity(query, vector)))
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scores.truncate(k);
        Ok(scores)
    }

    pub fn count(&self) -> usize {
        self.vectors.len()
    }

    pub fn all_vectors(&self) -> &HashMap<u64, Vec<f32>> {
        &self.vectors
    }

    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        match self.metric {
            Metric::Dot => dot,
            Metric::Cosine => {
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    0.0
                } else {
                    dot / (norm_a * norm_b)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_orders_by_similarity_then_id() {
        let mut index = VectorIndex::new(3, Metric::Cosine);
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.add(2, vec![0.0, 1.0, 0.0]).unwrap();
        index.add(3, vec![0.9, 0.1, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
    }

    #[test]
    fn equal_similarity_breaks_ties_by_ascending_id() {
        let mut index = VectorIndex::new(2, Metric::Cosine);
        index.add(9, vec![0.0, 1.0]).unwrap();
        index.add(4, vec![0.0, 1.0]).unwrap();

        let results = index.search(&[0.0, 1.0], 2).unwrap();
        assert_eq!(results[0].0, 4);
        assert_eq!(results[1].0, 9);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let mut index = VectorIndex::new(4, Metric::Cosine);
        assert!(matches!(
            index.add(1, vec![1.0, 0.0]),
            Err(StoreError::DimensionMismatch { expected: 4, got: 2 })
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn add_overwrites_and_remove_hides() {
        let mut index = VectorIndex::new(2, Metric::Cosine);
        index.add(1, vec![1.0, 0.0]).unwrap();
        index.add(1, vec![0.0, 1.0]).unwrap();
        assert_eq!(index.count(), 1);

        let top = index.search(&[0.0, 1.0], 1).unwrap();
        assert!((top[0].1 - 1.0).abs() < 1e-6);

        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert!(index.search(&[0.0, 1.0], 1).unwrap().is_empty());
    }

    #[test]
    fn dot_metric_skips_normalization() {
        let mut index = VectorIndex::new(2, Metric::Dot);
        index.add(1, vec![2.0, 0.0]).unwrap();
        let results = index.search(&[3.0, 0.0], 1).unwrap();
        assert!((results[0].1 - 6.0).abs() < 1e-6);
    }
}
