//! A single isolation tree.

use anomaly_processing::FeatureMatrix;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Expected path length of an unsuccessful search in a binary search tree
/// built from `n` points. Normalises isolation depths.
#[must_use]
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Tree node, stored in a flat arena. Children always have larger indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    /// Grow a tree on the given sample of row indices.
    ///
    /// Each split picks a feature uniformly among those not constant in the
    /// node and a threshold uniformly in `[min, max)`. Rows with a value at or
    /// below the threshold go left.
    pub fn fit(data: &FeatureMatrix, sample: &[usize], max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let mut indices = sample.to_vec();
        tree.grow(data, &mut indices, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &FeatureMatrix,
        indices: &mut [usize],
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let node_id = self.nodes.len();

        if depth >= max_depth || indices.len() <= 1 {
            self.nodes.push(Node::Leaf {
                size: indices.len(),
            });
            return node_id;
        }

        let candidates = feature_ranges(data, indices);
        if candidates.is_empty() {
            // every remaining row is identical
            self.nodes.push(Node::Leaf {
                size: indices.len(),
            });
            return node_id;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);

        // Placeholder, patched once both children exist
        self.nodes.push(Node::Leaf { size: 0 });

        let split_at = partition(indices, |row| data.get(row, feature) <= threshold);
        let (left_rows, right_rows) = indices.split_at_mut(split_at);

        let left = self.grow(data, left_rows, depth + 1, max_depth, rng);
        let right = self.grow(data, right_rows, depth + 1, max_depth, rng);

        self.nodes[node_id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        node_id
    }

    /// Isolation depth of a record plus the expected remaining depth at its leaf.
    #[must_use]
    pub fn path_length(&self, row: &[f64]) -> f64 {
        let mut node_id = 0;
        let mut depth = 0usize;

        loop {
            match &self.nodes[node_id] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node_id = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                    depth += 1;
                }
                Node::Leaf { size } => {
                    return depth as f64 + average_path_length(*size);
                }
            }
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Deepest leaf, counting the root as depth 0.
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match &nodes[id] {
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                Node::Leaf { .. } => 0,
            }
        }
        if self.nodes.is_empty() { 0 } else { walk(&self.nodes, 0) }
    }
}

/// `(feature, min, max)` for every feature that varies across `indices`.
fn feature_ranges(data: &FeatureMatrix, indices: &[usize]) -> Vec<(usize, f64, f64)> {
    (0..data.n_cols())
        .filter_map(|feature| {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for &row in indices {
                let value = data.get(row, feature);
                min = min.min(value);
                max = max.max(value);
            }
            (min < max).then_some((feature, min, max))
        })
        .collect()
}

/// Reorder `indices` so rows matching `pred` come first; returns their count.
fn partition(indices: &mut [usize], pred: impl Fn(usize) -> bool) -> usize {
    let mut split = 0;
    for i in 0..indices.len() {
        if pred(indices[i]) {
            indices.swap(split, i);
            split += 1;
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn line_data(n: usize) -> FeatureMatrix {
        FeatureMatrix::from_rows((0..n).map(|i| vec![i as f64, 0.0]).collect()).unwrap()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // 2 * (ln(255) + gamma) - 2 * 255 / 256
        let expected = 2.0 * (255f64.ln() + EULER_GAMMA) - 2.0 * 255.0 / 256.0;
        assert_eq!(average_path_length(256), expected);
    }

    #[test]
    fn test_tree_respects_max_depth() {
        let data = line_data(64);
        let sample: Vec<usize> = (0..64).collect();
        let mut rng = StdRng::seed_from_u64(1);

        let tree = IsolationTree::fit(&data, &sample, 3, &mut rng);
        assert!(tree.depth() <= 3);
        assert!(tree.n_nodes() > 1);
    }

    #[test]
    fn test_constant_data_is_a_single_leaf() {
        let data = FeatureMatrix::from_rows(vec![vec![1.0, 2.0]; 10]).unwrap();
        let sample: Vec<usize> = (0..10).collect();
        let mut rng = StdRng::seed_from_u64(1);

        let tree = IsolationTree::fit(&data, &sample, 8, &mut rng);
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.path_length(&[1.0, 2.0]), average_path_length(10));
    }

    #[test]
    fn test_never_splits_on_constant_feature() {
        let data = line_data(32);
        let sample: Vec<usize> = (0..32).collect();
        let mut rng = StdRng::seed_from_u64(9);

        let tree = IsolationTree::fit(&data, &sample, 5, &mut rng);
        for node in &tree.nodes {
            if let Node::Split { feature, .. } = node {
                assert_eq!(*feature, 0);
            }
        }
    }

    #[test]
    fn test_same_seed_same_tree() {
        let data = line_data(50);
        let sample: Vec<usize> = (0..50).collect();

        let a = IsolationTree::fit(&data, &sample, 6, &mut StdRng::seed_from_u64(3));
        let b = IsolationTree::fit(&data, &sample, 6, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_partition() {
        let mut indices = vec![5, 1, 4, 2, 3];
        let split = partition(&mut indices, |i| i <= 2);
        assert_eq!(split, 2);
        let mut left = indices[..split].to_vec();
        left.sort_unstable();
        assert_eq!(left, vec![1, 2]);
    }
}
