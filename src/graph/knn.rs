//! k-nearest-neighbour similarity graph over a feature matrix.

use std::collections::BTreeSet;

use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;

use super::EdgeIndex;

/// Connect every row to its `k` nearest rows by Euclidean distance, counting
/// the row itself as one of them, then make the graph undirected.
///
/// `k` is clamped to the number of rows. Ties break on the lower row index.
/// The result is deduplicated and sorted by (source, target).
pub fn knn_graph(x: ArrayView2<'_, f32>, k: usize) -> EdgeIndex {
    let n = x.nrows();
    if n == 0 || k == 0 {
        return EdgeIndex::new();
    }
    let k = k.min(n);

    let neighbours: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let row = x.row(i);
            let mut others: Vec<(f32, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (squared_distance(row, x.row(j)), j))
                .collect();
            others.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            std::iter::once(i)
                .chain(others.into_iter().take(k - 1).map(|(_, j)| j))
                .collect()
        })
        .collect();

    let mut pairs = BTreeSet::new();
    for (i, row) in neighbours.iter().enumerate() {
        for &j in row {
            pairs.insert((i, j));
            pairs.insert((j, i));
        }
    }
    pairs.into_iter().collect()
}

fn squared_distance(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(p, q)| (p - q) * (p - q)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_two_clusters() {
        let x = array![[0.0f32], [1.0], [10.0], [11.0]];
        let edges = knn_graph(x.view(), 2);
        let pairs: Vec<(usize, usize)> = edges.iter().collect();
        assert_eq!(
            pairs,
            vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 2), (2, 3), (3, 2), (3, 3)]
        );
    }

    #[test]
    fn test_result_is_symmetric() {
        // 3 is nearest to 2, but 2 has 1 as its only other neighbour.
        let x = array![[0.0f32, 0.0], [1.0, 0.0], [2.0, 0.0], [3.5, 0.0]];
        let edges = knn_graph(x.view(), 2);
        let pairs: BTreeSet<(usize, usize)> = edges.iter().collect();
        for &(s, t) in &pairs {
            assert!(pairs.contains(&(t, s)), "missing reverse of {s}->{t}");
        }
        assert!(pairs.contains(&(2, 3)));
    }

    #[test]
    fn test_k_clamped_to_rows() {
        let x = array![[0.0f32], [1.0], [2.0]];
        assert_eq!(knn_graph(x.view(), 50).len(), 9);
    }

    #[test]
    fn test_empty_input() {
        let x = ndarray::Array2::<f32>::zeros((0, 3));
        assert!(knn_graph(x.view(), 5).is_empty());
    }

    #[test]
    fn test_k_one_is_self_loops_only() {
        let x = array![[0.0f32], [5.0]];
        let pairs: Vec<(usize, usize)> = knn_graph(x.view(), 1).iter().collect();
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
    }
}
