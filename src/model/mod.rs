pub mod base;
pub mod eval;
mod liblinear;
mod online;
pub mod train;
pub mod tree;
pub mod vector;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::util::elapsed_secs;
use crate::{Index, Label, Weight};
use log::info;
use ordered_float::NotNan;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use self::base::Base;
use self::tree::Tree;

/// A ranked prediction: label and its path probability.
pub type Prediction = (Label, Weight);

/// Heap entry for the best-first search. Ties on probability break on the
/// node index so traversal order is deterministic.
#[derive(PartialEq, Eq)]
struct NodeProb {
    prob: NotNan<Weight>,
    node: usize,
}

impl Ord for NodeProb {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prob
            .cmp(&other.prob)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for NodeProb {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A trained Probabilistic Label Tree: the topology plus one binary
/// classifier per node, read back from a model directory.
pub struct Model {
    tree: Tree,
    bases: Vec<Base>,
}

impl Model {
    pub fn load(model_dir: &Path, config: &Config) -> Result<Model> {
        info!("Loading model from {} ...", model_dir.display());
        let start_t = Instant::now();

        let tree = Tree::load_from_file(model_dir.join("tree.bin"))?;
        let bases = (0..tree.node_count())
            .map(|i| {
                let path = model_dir.join(format!("node_{}.bin", i));
                let mut input = BufReader::new(File::open(&path).map_err(|e| {
                    Error::Model(format!("cannot open {}: {}", path.display(), e))
                })?);
                Base::load(&mut input, config.load_as, false)
            })
            .collect::<Result<Vec<_>>>()?;

        let mem: usize = bases.iter().map(Base::mem).sum();
        info!(
            "Loaded {} nodes, {} labels, ~{}KiB of weights; it took {:.2}s",
            tree.node_count(),
            tree.label_count(),
            mem / 1024,
            elapsed_secs(&start_t)
        );
        Ok(Model { tree, bases })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Best-first top-K search: repeatedly expand the most probable frontier
    /// node, multiplying child probabilities into the path probability, until
    /// `top_k` leaves have been collected.
    pub fn predict(&self, features: &[(Index, Weight)], top_k: usize) -> Vec<Prediction> {
        let mut heap = BinaryHeap::new();
        let mut predictions = Vec::with_capacity(top_k);

        let root = self.tree.root();
        heap.push(NodeProb {
            prob: NotNan::new(self.bases[root].predict_probability(features))
                .expect("node probability is NaN"),
            node: root,
        });

        while let Some(NodeProb { prob, node }) = heap.pop() {
            let node = self.tree.node(node);
            if let Some(label) = node.label {
                predictions.push((label, prob.into_inner()));
                if predictions.len() >= top_k {
                    break;
                }
            } else {
                for &child in &node.children {
                    let p = prob.into_inner() * self.bases[child].predict_probability(features);
                    heap.push(NodeProb {
                        prob: NotNan::new(p).expect("node probability is NaN"),
                        node: child,
                    });
                }
            }
        }

        predictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Loss, Representation};
    use crate::model::vector::Weights;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // a logit that sigmoids to the requested probability
    fn logit(p: Weight) -> Weight {
        (p / (1.0 - p)).ln()
    }

    fn constant_base(p: Weight) -> Base {
        let mut w = Weights::new_dense(2);
        w.set(1, logit(p));
        Base::from_parts(Loss::Logistic, 2, 1, Some(w))
    }

    /// k=2 tree whose leaf probabilities are fixed by construction.
    fn two_leaf_model(p_left: Weight, p_right: Weight) -> Model {
        let tree = Tree::build_complete(2, 2, false, &mut StdRng::seed_from_u64(0));
        let bases = vec![
            constant_base(0.999),
            constant_base(p_left),
            constant_base(p_right),
        ];
        Model { tree, bases }
    }

    #[test]
    fn test_top_k_orders_by_probability() {
        let model = two_leaf_model(0.9, 0.1);
        let predictions = model.predict(&[(1, 1.0)], 2);
        assert_eq!(2, predictions.len());
        assert_eq!(0, predictions[0].0);
        assert_eq!(1, predictions[1].0);
        assert!(predictions[0].1 > predictions[1].1);
        assert!((predictions[0].1 - 0.999 * 0.9).abs() < 1e-6);

        let flipped = two_leaf_model(0.1, 0.9);
        let predictions = flipped.predict(&[(1, 1.0)], 2);
        assert_eq!(1, predictions[0].0);
    }

    #[test]
    fn test_probabilities_monotonically_non_increasing() {
        let tree = Tree::build_complete(8, 2, false, &mut StdRng::seed_from_u64(0));
        let probs = [0.99, 0.7, 0.4, 0.8, 0.3, 0.6, 0.5, 0.2, 0.9, 0.35, 0.65, 0.45, 0.55, 0.25, 0.75];
        let bases = probs.iter().map(|&p| constant_base(p)).collect();
        let model = Model { tree, bases };

        let predictions = model.predict(&[(1, 1.0)], 8);
        assert_eq!(8, predictions.len());
        for pair in predictions.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_top_k_truncates() {
        let model = two_leaf_model(0.9, 0.1);
        assert_eq!(1, model.predict(&[(1, 1.0)], 1).len());
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let model = two_leaf_model(0.5, 0.5);
        let first = model.predict(&[(1, 1.0)], 2);
        for _ in 0..10 {
            assert_eq!(first, model.predict(&[(1, 1.0)], 2));
        }
    }

    #[test]
    fn test_model_directory_round_trip() {
        use crate::config::Optimizer;
        use crate::data::DataSet;
        use crate::model::train::PltTrainer;

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.optimizer = Optimizer::Sgd;
        config.epochs = 20;
        config.weights_threshold = 0.0;
        config.load_as = Representation::Dense;

        // two labels separable on the sign of feature 2
        let rows = 100;
        let dataset = DataSet {
            n_features: 3,
            n_labels: 2,
            feature_lists: (0..rows)
                .map(|i| vec![(1, 1.0), (2, if i % 2 == 0 { 1.0 } else { -1.0 })])
                .collect(),
            label_lists: (0..rows).map(|i| vec![(i % 2) as Label]).collect(),
        };

        PltTrainer::new(config.clone())
            .train(&dataset, dir.path())
            .unwrap();
        let model = Model::load(dir.path(), &config).unwrap();

        let positive = model.predict(&[(1, 1.0), (2, 1.0)], 2);
        assert_eq!(0, positive[0].0);
        let negative = model.predict(&[(1, 1.0), (2, -1.0)], 2);
        assert_eq!(1, negative[0].0);

        // a second load must reproduce predictions bit-exactly
        let again = Model::load(dir.path(), &config).unwrap();
        for features in &[vec![(1, 1.0), (2, 0.25)], vec![(1, 1.0), (2, -2.0)]] {
            let a = model.predict(features, 2);
            let b = again.predict(features, 2);
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(&b) {
                assert_eq!(x.0, y.0);
                assert_eq!(x.1.to_bits(), y.1.to_bits());
            }
        }
    }
}
