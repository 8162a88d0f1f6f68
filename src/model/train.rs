use crate::config::{Config, TreeKind};
use crate::data::DataSet;
use crate::error::{Error, Result};
use crate::model::base::{Base, TrainData};
use crate::model::tree::Tree;
use crate::util::{create_progress_bar, elapsed_secs};
use hashbrown::HashSet;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Trains one binary classifier per tree node and persists the result into a
/// model directory: `node_<i>.bin` for every node plus `tree.bin`.
pub struct PltTrainer {
    config: Config,
}

/// The tree nodes a single example supervises: every ancestor of its labelled
/// leaves is positive, every non-positive child of a positive node is
/// negative. Label-less examples mark only the root negative.
fn assign_example_nodes(tree: &Tree, labels: &[crate::Label]) -> Result<(HashSet<usize>, HashSet<usize>)> {
    let mut positive = HashSet::new();
    let mut negative = HashSet::new();

    if labels.is_empty() {
        negative.insert(tree.root());
        return Ok((positive, negative));
    }

    for &label in labels {
        let leaf = tree
            .leaf(label)
            .ok_or_else(|| Error::Data(format!("label {} has no leaf in the tree", label)))?;
        let mut n = leaf;
        while positive.insert(n) {
            match tree.node(n).parent {
                Some(parent) => n = parent,
                None => break,
            }
        }
    }

    let mut queue = VecDeque::new();
    queue.push_back(tree.root());
    while let Some(n) = queue.pop_front() {
        for &child in &tree.node(n).children {
            if positive.contains(&child) {
                queue.push_back(child);
            } else {
                negative.insert(child);
            }
        }
    }

    Ok((positive, negative))
}

impl PltTrainer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn obtain_tree(&self, dataset: &DataSet) -> Result<Tree> {
        if let Some(path) = &self.config.tree_file {
            return Tree::load_structure(path);
        }
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let randomize = self.config.tree_kind == TreeKind::CompleteRandom;
        Ok(Tree::build_complete(
            dataset.n_labels,
            self.config.arity,
            randomize,
            &mut rng,
        ))
    }

    /// Train over the dataset and write the model into `model_dir`.
    pub fn train(&self, dataset: &DataSet, model_dir: &Path) -> Result<Tree> {
        info!("Training tree ...");
        let start_t = Instant::now();

        let tree = self.obtain_tree(dataset)?;
        let rows = dataset.rows();
        assert_eq!(rows, dataset.label_lists.len());
        if tree.label_count() < dataset.n_labels {
            return Err(Error::Data(format!(
                "tree has {} labels but the dataset declares {}",
                tree.label_count(),
                dataset.n_labels
            )));
        }

        // Per-node supervision: example indices paired with binary labels,
        // positives of each example appended before its negatives. Rows are
        // referenced by index; the feature matrix stays where it is.
        let t = tree.node_count();
        let mut node_labels: Vec<Vec<f64>> = vec![Vec::new(); t];
        let mut node_rows: Vec<Vec<u32>> = vec![Vec::new(); t];

        info!("  Assigning points ...");
        let mut pb = create_progress_bar(rows as u64);
        let mut node_count = 0usize;
        let mut label_count = 0usize;
        for r in 0..rows {
            let (positive, negative) = assign_example_nodes(&tree, &dataset.label_lists[r])?;

            for &n in &positive {
                node_labels[n].push(1.0);
                node_rows[n].push(r as u32);
            }
            for &n in &negative {
                node_labels[n].push(0.0);
                node_rows[n].push(r as u32);
            }

            node_count += positive.len() + negative.len();
            label_count += dataset.label_lists[r].len();
            pb.inc();
        }
        pb.finish();

        info!(
            "  Points count: {}, nodes per point: {:.4}, labels per point: {:.4}",
            rows,
            node_count as f64 / rows as f64,
            label_count as f64 / rows as f64
        );

        info!("  Starting training in {} threads ...", self.config.threads);
        let supervision: Vec<(Vec<f64>, Vec<u32>)> =
            node_labels.into_iter().zip(node_rows).collect();

        let pb = Mutex::new(create_progress_bar(t as u64));
        let job = |(i, (labels, rows_idx)): (usize, (Vec<f64>, Vec<u32>))| -> Result<()> {
            let features = rows_idx
                .iter()
                .map(|&r| dataset.feature_lists[r as usize].as_slice())
                .collect::<Vec<_>>();
            let instance_weights = vec![1.0; labels.len()];
            let data = TrainData {
                n_features: dataset.n_features,
                labels,
                features,
                instance_weights,
                dataset_rows: rows,
                inv_ps: 1.0,
            };

            let mut base = Base::new();
            base.train(data, &self.config)?;

            let path = model_dir.join(format!("node_{}.bin", i));
            let mut out = BufWriter::new(File::create(path)?);
            base.save(&mut out)?;

            pb.lock().expect("Failed to lock progress bar").inc();
            Ok(())
        };

        if self.config.threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.threads)
                .build()
                .map_err(|e| Error::Config(format!("failed to build thread pool: {}", e)))?;
            pool.install(|| {
                supervision
                    .into_par_iter()
                    .enumerate()
                    .map(job)
                    .collect::<Result<Vec<()>>>()
            })?;
        } else {
            for item in supervision.into_iter().enumerate() {
                job(item)?;
            }
        }
        pb.into_inner().expect("Failed to unwrap progress bar").finish();

        tree.save_to_file(model_dir.join("tree.bin"))?;

        info!(
            "Trained {} nodes; it took {:.2}s",
            t,
            elapsed_secs(&start_t)
        );
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Optimizer;
    use crate::model::Model;
    use itertools::Itertools;

    fn toy_tree() -> Tree {
        // 0 -> (1, 2); 1 -> (3: label 0, 4: label 1); 2 -> (5: label 2, 6: label 3)
        Tree::build_complete(4, 2, false, &mut StdRng::seed_from_u64(0))
    }

    #[test]
    fn test_assign_single_label() {
        let tree = toy_tree();
        let (positive, negative) = assign_example_nodes(&tree, &[0]).unwrap();

        // the labelled leaf and its ancestors up to the root
        assert_eq!(
            vec![0, 1, 3],
            positive.iter().copied().sorted().collect_vec()
        );
        // the frontier below the positive set
        assert_eq!(vec![2, 4], negative.iter().copied().sorted().collect_vec());
        assert!(positive.is_disjoint(&negative));
    }

    #[test]
    fn test_assign_multiple_labels() {
        let tree = toy_tree();
        let (positive, negative) = assign_example_nodes(&tree, &[0, 3]).unwrap();
        assert_eq!(
            vec![0, 1, 2, 3, 6],
            positive.iter().copied().sorted().collect_vec()
        );
        assert_eq!(vec![4, 5], negative.iter().copied().sorted().collect_vec());
    }

    #[test]
    fn test_assign_label_less_row_marks_root_negative() {
        let tree = toy_tree();
        let (positive, negative) = assign_example_nodes(&tree, &[]).unwrap();
        assert!(positive.is_empty());
        assert_eq!(vec![tree.root()], negative.into_iter().collect_vec());
    }

    #[test]
    fn test_assign_unknown_label_fails() {
        let tree = toy_tree();
        assert!(assign_example_nodes(&tree, &[17]).is_err());
    }

    fn single_label_dataset(label: crate::Label, rows: usize) -> DataSet {
        DataSet {
            n_features: 4,
            n_labels: 4,
            feature_lists: (0..rows).map(|_| vec![(1, 1.0), (2, 1.0)]).collect(),
            label_lists: (0..rows).map(|_| vec![label]).collect(),
        }
    }

    #[test]
    fn test_single_label_dataset_predicts_that_label() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.optimizer = Optimizer::Sgd;
        config.epochs = 3;

        let dataset = single_label_dataset(2, 20);
        let tree = PltTrainer::new(config.clone())
            .train(&dataset, dir.path())
            .unwrap();
        assert_eq!(7, tree.node_count());

        let model = Model::load(dir.path(), &config).unwrap();
        let prediction = model.predict(&[(1, 1.0), (2, 1.0)], 1);
        assert_eq!(2, prediction[0].0);
        assert!(prediction[0].1 > 0.99);
    }

    #[test]
    fn test_parallel_and_serial_training_agree() {
        let mut config = Config::default();
        config.epochs = 2;
        config.optimizer = Optimizer::Adagrad;

        let dataset = DataSet {
            n_features: 5,
            n_labels: 3,
            feature_lists: vec![
                vec![(1, 1.0), (2, 1.0)],
                vec![(1, 1.0), (3, 1.0)],
                vec![(1, 1.0), (4, 1.0)],
                vec![(1, 1.0), (2, 0.5), (3, 0.5)],
            ],
            label_lists: vec![vec![0], vec![1], vec![2], vec![0, 1]],
        };

        let serial_dir = tempfile::tempdir().unwrap();
        PltTrainer::new(config.clone())
            .train(&dataset, serial_dir.path())
            .unwrap();

        let mut parallel_config = config.clone();
        parallel_config.threads = 4;
        let parallel_dir = tempfile::tempdir().unwrap();
        PltTrainer::new(parallel_config)
            .train(&dataset, parallel_dir.path())
            .unwrap();

        // node jobs are independent, so per-node outputs must match exactly
        let tree = Tree::load_from_file(serial_dir.path().join("tree.bin")).unwrap();
        for i in 0..tree.node_count() {
            let name = format!("node_{}.bin", i);
            let serial = std::fs::read(serial_dir.path().join(&name)).unwrap();
            let parallel = std::fs::read(parallel_dir.path().join(&name)).unwrap();
            assert_eq!(serial, parallel, "node file {} differs", name);
        }
    }
}
