//! ANN engine capability used by the index manager.
//!
//! The manager treats an engine as a disposable cache over its own vector
//! store: engines are never serialized, only rebuilt from a snapshot.

use anyhow::{anyhow, bail};
use log::debug;

use super::snapshot::IndexParams;

/// Insert/search over fixed-dimension vectors with cosine distance.
pub trait AnnEngine: Send + Sync {
    fn insert(&mut self, id: u32, vector: &[f32]) -> anyhow::Result<()>;

    /// Up to `k` nearest `(id, distance)` pairs, ascending by distance.
    fn search(&self, query: &[f32], k: usize) -> anyhow::Result<Vec<(u32, f32)>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds an empty engine for the given parameters.
pub type EngineFactory = Box<dyn Fn(&IndexParams) -> Box<dyn AnnEngine> + Send + Sync>;

/// Factory for the engine selected at compile time: HNSW with the `hnsw`
/// feature, the exact flat engine otherwise.
pub fn default_engine_factory() -> EngineFactory {
    #[cfg(feature = "hnsw")]
    {
        Box::new(|params: &IndexParams| -> Box<dyn AnnEngine> { Box::new(HnswEngine::new(params)) })
    }
    #[cfg(not(feature = "hnsw"))]
    {
        Box::new(|params: &IndexParams| -> Box<dyn AnnEngine> { Box::new(FlatEngine::new(params)) })
    }
}

/// Cosine distance in `[0, 2]`; zero-norm vectors are at distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        return 1.0;
    }
    (1.0 - dot / denom).max(0.0)
}

/// Exact engine: scans every vector. Deterministic, ties broken by id.
pub struct FlatEngine {
    dimensions: usize,
    max_elements: usize,
    entries: Vec<(u32, Vec<f32>)>,
}

impl FlatEngine {
    pub fn new(params: &IndexParams) -> Self {
        Self {
            dimensions: params.dimensions,
            max_elements: params.max_elements,
            entries: Vec::new(),
        }
    }
}

impl AnnEngine for FlatEngine {
    fn insert(&mut self, id: u32, vector: &[f32]) -> anyhow::Result<()> {
        if vector.len() != self.dimensions {
            bail!(
                "vector has {} dimensions, engine expects {}",
                vector.len(),
                self.dimensions
            );
        }
        if self.entries.len() >= self.max_elements {
            bail!("engine is full ({} elements)", self.max_elements);
        }
        self.entries.push((id, vector.to_vec()));
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> anyhow::Result<Vec<(u32, f32)>> {
        if query.len() != self.dimensions {
            return Err(anyhow!(
                "query has {} dimensions, engine expects {}",
                query.len(),
                self.dimensions
            ));
        }
        let mut scored: Vec<(u32, f32)> = self
            .entries
            .iter()
            .map(|(id, vector)| (*id, cosine_distance(query, vector)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        debug!("Flat search scanned {} vectors.", self.entries.len());
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(feature = "hnsw")]
pub use hnsw::HnswEngine;

#[cfg(feature = "hnsw")]
mod hnsw {
    use super::{AnnEngine, IndexParams};
    use anyhow::bail;
    use hnsw_rs::prelude::*;

    const MAX_LAYER: usize = 16;

    /// Approximate engine backed by `hnsw_rs`. The seed is carried for the
    /// snapshot only; `hnsw_rs` draws its own layer levels.
    pub struct HnswEngine {
        index: Hnsw<'static, f32, DistCosine>,
        dimensions: usize,
        max_elements: usize,
        ef_construction: usize,
        len: usize,
    }

    impl HnswEngine {
        pub fn new(params: &IndexParams) -> Self {
            let index = Hnsw::new(
                params.m,
                params.max_elements,
                MAX_LAYER,
                params.ef_construction,
                DistCosine {},
            );
            Self {
                index,
                dimensions: params.dimensions,
                max_elements: params.max_elements,
                ef_construction: params.ef_construction,
                len: 0,
            }
        }
    }

    impl AnnEngine for HnswEngine {
        fn insert(&mut self, id: u32, vector: &[f32]) -> anyhow::Result<()> {
            if vector.len() != self.dimensions {
                bail!(
                    "vector has {} dimensions, engine expects {}",
                    vector.len(),
                    self.dimensions
                );
            }
            if self.len >= self.max_elements {
                bail!("engine is full ({} elements)", self.max_elements);
            }
            self.index.insert((vector, id as usize));
            self.len += 1;
            Ok(())
        }

        fn search(&self, query: &[f32], k: usize) -> anyhow::Result<Vec<(u32, f32)>> {
            if query.len() != self.dimensions {
                bail!(
                    "query has {} dimensions, engine expects {}",
                    query.len(),
                    self.dimensions
                );
            }
            let k = k.min(self.len);
            if k == 0 {
                return Ok(Vec::new());
            }
            let ef = self.ef_construction.max(k * 2);
            let hits = self
                .index
                .search(query, k, ef)
                .into_iter()
                .map(|n| (n.d_id as u32, n.distance.max(0.0)))
                .collect();
            Ok(hits)
        }

        fn len(&self) -> usize {
            self.len
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dimensions: usize, max_elements: usize) -> IndexParams {
        IndexParams {
            dimensions,
            max_elements,
            m: 16,
            ef_construction: 200,
            seed: 100,
        }
    }

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_flat_search_orders_by_distance_then_id() {
        let mut engine = FlatEngine::new(&params(2, 10));
        engine.insert(7, &[0.0, 1.0]).unwrap();
        engine.insert(3, &[1.0, 0.0]).unwrap();
        engine.insert(1, &[1.0, 0.0]).unwrap();
        engine.insert(5, &[1.0, 1.0]).unwrap();

        let hits = engine.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<u32> = hits.iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_flat_engine_rejects_wrong_dimensions_and_overflow() {
        let mut engine = FlatEngine::new(&params(3, 1));
        assert!(engine.insert(0, &[1.0, 0.0]).is_err());
        engine.insert(0, &[1.0, 0.0, 0.0]).unwrap();
        assert!(engine.insert(1, &[0.0, 1.0, 0.0]).is_err());
        assert!(engine.search(&[1.0], 1).is_err());
        assert_eq!(engine.len(), 1);
    }

    #[cfg(feature = "hnsw")]
    fn axis(dimensions: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimensions];
        v[i] = 1.0;
        v
    }

    #[cfg(feature = "hnsw")]
    #[test]
    fn test_hnsw_self_query_and_oversized_k() {
        let mut engine = HnswEngine::new(&params(4, 10));
        assert!(engine.search(&axis(4, 0), 3).unwrap().is_empty());
        for i in 0..3 {
            engine.insert(i as u32, &axis(4, i)).unwrap();
        }

        let hits = engine.search(&axis(4, 1), 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1.abs() < 1e-5);

        let hits = engine.search(&axis(4, 2), 10).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, 2);
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[cfg(feature = "hnsw")]
    #[test]
    fn test_hnsw_engine_rejects_wrong_dimensions_and_overflow() {
        let mut engine = HnswEngine::new(&params(3, 1));
        assert!(engine.insert(0, &[1.0, 0.0]).is_err());
        engine.insert(0, &[1.0, 0.0, 0.0]).unwrap();
        assert!(engine.insert(1, &[0.0, 1.0, 0.0]).is_err());
        assert!(engine.search(&[1.0], 1).is_err());
        assert_eq!(engine.len(), 1);
    }
}
