//! Coarse quantizer for the inverted-file layout: spherical k-means over
//! unit vectors, one posting list per centroid.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

const KMEANS_SEED: u64 = 0x5eed_0f_1dea;

#[derive(Debug, Clone)]
pub struct CoarseQuantizer {
    centroids: Vec<Array1<f32>>,
    lists: Vec<Vec<usize>>,
}

impl CoarseQuantizer {
    /// Train `nlist` centroids over `vectors` (all unit length). `ids[i]` is
    /// the entry position stored in the posting list for `vectors[i]`.
    pub fn train(vectors: &[&Array1<f32>], ids: &[usize], nlist: usize, iterations: usize) -> Self {
        let nlist = nlist.clamp(1, vectors.len().max(1));
        let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
        let mut centroids: Vec<Array1<f32>> = sample(&mut rng, vectors.len(), nlist)
            .into_iter()
            .map(|i| vectors[i].clone())
            .collect();

        let mut assignment = vec![0usize; vectors.len()];
        for _ in 0..iterations.max(1) {
            let mut changed = false;
            for (i, v) in vectors.iter().enumerate() {
                let best = nearest(&centroids, v);
                if best != assignment[i] {
                    assignment[i] = best;
                    changed = true;
                }
            }

            let dim = centroids.first().map_or(0, |c| c.len());
            let mut sums = vec![Array1::<f32>::zeros(dim); centroids.len()];
            for (i, v) in vectors.iter().enumerate() {
                sums[assignment[i]] += *v;
            }
            for (centroid, sum) in centroids.iter_mut().zip(sums) {
                let norm = sum.dot(&sum).sqrt();
                // Empty cluster keeps its previous centroid.
                if norm > 0.0 {
                    *centroid = sum / norm;
                }
            }
            if !changed {
                break;
            }
        }

        let mut lists = vec![Vec::new(); centroids.len()];
        for (i, v) in vectors.iter().enumerate() {
            lists[nearest(&centroids, v)].push(ids[i]);
        }
        Self { centroids, lists }
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    /// Append an entry to the list of its nearest centroid.
    pub fn assign(&mut self, vector: &Array1<f32>, id: usize) {
        let list = nearest(&self.centroids, vector);
        self.lists[list].push(id);
    }

    /// Entry positions in the `nprobe` lists closest to `query`.
    pub fn probe(&self, query: &Array1<f32>, nprobe: usize) -> Vec<usize> {
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.dot(query)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        order
            .into_iter()
            .take(nprobe.max(1))
            .flat_map(|(i, _)| self.lists[i].iter().copied())
            .collect()
    }
}

fn nearest(centroids: &[Array1<f32>], v: &Array1<f32>) -> usize {
    let mut best = 0;
    let mut best_sim = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let sim = c.dot(v);
        if sim > best_sim {
            best_sim = sim;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_separates_obvious_clusters() {
        let vs = [
            array![1.0f32, 0.0],
            array![0.995, 0.0998],
            array![0.0, 1.0],
            array![0.0998, 0.995],
        ];
        let refs: Vec<&Array1<f32>> = vs.iter().collect();
        let q = CoarseQuantizer::train(&refs, &[10, 11, 12, 13], 2, 10);
        assert_eq!(q.nlist(), 2);

        let mut near_x = q.probe(&array![1.0, 0.0], 1);
        near_x.sort();
        assert_eq!(near_x, vec![10, 11]);
        let mut all = q.probe(&array![1.0, 0.0], 2);
        all.sort();
        assert_eq!(all, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_nlist_bounded_by_points() {
        let vs = [array![1.0f32, 0.0]];
        let refs: Vec<&Array1<f32>> = vs.iter().collect();
        let q = CoarseQuantizer::train(&refs, &[0], 8, 3);
        assert_eq!(q.nlist(), 1);
    }
}
