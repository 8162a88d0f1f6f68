use crate::binio;
use crate::config::{Config, Loss, Optimizer, Representation};
use crate::data::BIAS_FEATURE;
use crate::error::{Error, Result};
use crate::model::{liblinear, online};
use crate::model::vector::Weights;
use crate::{Index, Weight};
use std::io::{Read, Write};
use std::mem::size_of;

/// Supervision for a single tree node: binary labels aligned with borrowed
/// feature rows, plus dataset-level context for cost scaling.
pub struct TrainData<'a> {
    /// Number of feature columns, including the reserved ids.
    pub n_features: usize,
    /// One 0.0/1.0 label per feature row.
    pub labels: Vec<Weight>,
    pub features: Vec<&'a [(Index, Weight)]>,
    pub instance_weights: Vec<Weight>,
    /// Total rows in the dataset the supervision was drawn from.
    pub dataset_rows: usize,
    /// Inverse propensity applied to positives under `pwLogistic`.
    pub inv_ps: Weight,
}

/// A binary probabilistic classifier attached to one tree node.
///
/// Nodes whose supervision contained a single class (or nothing at all) train
/// no weights; prediction then returns a fixed extreme logit whose sign
/// encodes the class that was seen.
pub struct Base {
    loss: Loss,
    class_count: u32,
    first_class: u32,
    first_class_count: u64,
    t: u64,
    w: Option<Weights>,
    g: Option<Weights>,
}

impl Default for Base {
    fn default() -> Self {
        Self::new()
    }
}

impl Base {
    pub fn new() -> Self {
        Self {
            loss: Loss::Logistic,
            class_count: 0,
            first_class: 0,
            first_class_count: 0,
            t: 0,
            w: None,
            g: None,
        }
    }

    pub fn class_count(&self) -> u32 {
        self.class_count
    }

    pub fn first_class(&self) -> u32 {
        self.first_class
    }

    pub fn first_class_count(&self) -> u64 {
        self.first_class_count
    }

    /// Number of online updates applied so far.
    pub fn updates(&self) -> u64 {
        self.t
    }

    pub fn weights(&self) -> Option<&Weights> {
        self.w.as_ref()
    }

    /// Train on the given supervision.
    ///
    /// Empty supervision and single-class supervision short-circuit without
    /// creating weights; otherwise training dispatches to the dual solver or
    /// the online loop, prunes the result and keeps it in whichever of the
    /// dense/sparse layouts is predicted smaller.
    pub fn train(&mut self, data: TrainData, config: &Config) -> Result<()> {
        if data.labels.is_empty() {
            self.first_class = 0;
            self.class_count = 0;
            return Ok(());
        }

        assert_eq!(data.labels.len(), data.features.len());
        assert!(data.instance_weights.len() >= data.labels.len());

        let positives = data.labels.iter().filter(|&&l| l == 1.0).count();
        if positives == 0 || positives == data.labels.len() {
            self.first_class = data.labels[0] as u32;
            self.class_count = 1;
            return Ok(());
        }

        // Apply some weighting for very unbalanced supervision
        let class_weights = if config.inbalance_labels_weighting {
            let negatives = data.labels.len() - positives;
            if negatives > positives {
                [1.0, 1.0 + (negatives as Weight / positives as Weight).ln()]
            } else {
                [1.0 + (positives as Weight / negatives as Weight).ln(), 1.0]
            }
        } else {
            [1.0, 1.0]
        };

        match config.optimizer {
            Optimizer::Liblinear => self.train_liblinear(&data, class_weights, config)?,
            Optimizer::Sgd | Optimizer::Adagrad => self.train_online(&data, config),
        }

        self.prune_weights(config.weights_threshold);
        if let Some(w) = self.w.take() {
            let non_zero = w.non_zero();
            let sparse = Weights::estimate_mem(Representation::Sparse, w.size(), non_zero);
            let dense = Weights::estimate_mem(Representation::Dense, w.size(), non_zero);
            self.w = Some(if sparse < dense {
                w.into_representation(Representation::Sparse)
            } else {
                w
            });
        }
        Ok(())
    }

    fn train_liblinear(
        &mut self,
        data: &TrainData,
        class_weights: [Weight; 2],
        config: &Config,
    ) -> Result<()> {
        let m = data.features.len();
        let mut cost = config.cost;
        if config.auto_c_log {
            cost *= 1.0 + (data.dataset_rows as Weight / m as Weight).ln();
        }
        if config.auto_c_lin {
            cost *= data.dataset_rows as Weight / m as Weight;
        }

        // The solver treats the first-seen class as the positive one.
        let first_label = data.labels[0];
        let y: Vec<bool> = data.labels.iter().map(|&l| l == first_label).collect();
        let costs: Vec<Weight> = data
            .labels
            .iter()
            .zip(&data.instance_weights)
            .map(|(&l, &iw)| cost * class_weights[l as usize] * iw)
            .collect();

        type Solver =
            fn(usize, &[&[(Index, Weight)]], &[bool], &[Weight], Weight, u32) -> liblinear::DenseVec;
        let solver: Solver = match config.loss {
            Loss::Logistic => liblinear::solve_l2r_lr_dual,
            Loss::SquaredHinge => liblinear::solve_l2r_l2_svc,
            Loss::PwLogistic => {
                return Err(Error::Config(
                    "pwLogistic loss is only available with online optimizers".to_owned(),
                ))
            }
        };
        let w = solver(
            data.n_features,
            &data.features,
            &y,
            &costs,
            config.eps,
            config.max_iter,
        );

        self.loss = config.loss;
        self.first_class = first_label as u32;
        self.class_count = 2;
        self.w = Some(Weights::Dense(w));
        self.g = None;
        Ok(())
    }

    fn train_online(&mut self, data: &TrainData, config: &Config) {
        self.loss = config.loss;
        self.class_count = 2;
        self.first_class = 1;
        self.first_class_count = 0;
        self.t = 0;

        let mut w = Weights::new_dense(data.n_features);
        let mut g = match config.optimizer {
            Optimizer::Adagrad => Some(Weights::new_dense(data.n_features)),
            _ => None,
        };

        let grad_fn = online::grad_fn(config.loss);
        let update_fn = online::update_fn(config.optimizer);

        'epochs: for _ in 0..config.epochs {
            for (r, &features) in data.features.iter().enumerate() {
                if config.tmax != -1 && self.t > config.tmax as u64 {
                    break 'epochs;
                }
                let label = data.labels[r];

                self.t += 1;
                if label == self.first_class as Weight {
                    self.first_class_count += 1;
                }

                let pred = w.dot(features);
                let grad = grad_fn(label, pred, data.inv_ps) * data.instance_weights[r];
                update_fn(&mut w, g.as_mut(), features, grad, self.t, config);
            }
        }

        self.w = Some(w);
        self.g = g;
    }

    /// Prepare the learner for streamed updates when no supervision lists are
    /// materialised up front. With an unknown feature count the weights start
    /// map-backed.
    pub fn setup_online_training(
        &mut self,
        config: &Config,
        n_features: usize,
        start_with_dense: bool,
    ) {
        self.loss = config.loss;
        let make = |dim| {
            if dim != 0 && start_with_dense {
                Weights::new_dense(dim)
            } else {
                Weights::new_map(dim)
            }
        };
        self.w = Some(make(n_features));
        self.g = match config.optimizer {
            Optimizer::Adagrad => Some(make(n_features)),
            _ => None,
        };
        self.class_count = 2;
        self.first_class = 1;
        self.first_class_count = 0;
        self.t = 0;
    }

    /// Apply a single online update.
    ///
    /// `&mut self` gives a sole owner the exclusion this needs; callers that
    /// stream updates from several threads wrap the learner in a lock.
    pub fn update(&mut self, label: Weight, features: &[(Index, Weight)], config: &Config) {
        if config.tmax != -1 && self.t > config.tmax as u64 {
            return;
        }

        self.t += 1;
        if label == self.first_class as Weight {
            self.first_class_count += 1;
        }

        let w = self.w.as_mut().expect("online training has not been set up");
        let pred = w.dot(features);
        let grad = online::grad_fn(self.loss)(label, pred, 1.0);
        online::update_fn(config.optimizer)(w, self.g.as_mut(), features, grad, self.t, config);
    }

    /// Drop near-zero weights; the bias weight survives every prune.
    pub fn prune_weights(&mut self, threshold: Weight) {
        if let Some(w) = self.w.as_mut() {
            let bias = w.get(BIAS_FEATURE);
            w.prune(threshold);
            w.set(BIAS_FEATURE, bias);
        }
    }

    /// Raw decision value. Single-class nodes return an extreme logit whose
    /// sign encodes the class they saw.
    pub fn predict_value(&self, features: &[(Index, Weight)]) -> Weight {
        if self.class_count < 2 {
            return ((1 - 2 * self.first_class as i32) * -10) as Weight;
        }
        let mut val = match &self.w {
            Some(w) => w.dot(features),
            None => 0.0,
        };
        if self.first_class == 0 {
            val = -val;
        }
        val
    }

    pub fn predict_probability(&self, features: &[(Index, Weight)]) -> Weight {
        let val = self.predict_value(features);
        match self.loss {
            Loss::SquaredHinge => (-(1.0 - val).max(0.0).powi(2)).exp(),
            Loss::Logistic | Loss::PwLogistic => online::sigmoid(val),
        }
    }

    /// Relabel which class counts as the first one, flipping the weights in
    /// place so predictions are unchanged.
    pub fn set_first_class(&mut self, first_class: u32) {
        if self.first_class != first_class {
            if let Some(w) = self.w.as_mut() {
                w.invert();
            }
            if let Some(g) = self.g.as_mut() {
                g.invert();
            }
            self.first_class = first_class;
        }
    }

    /// Convert held vectors to the given layout.
    pub fn to_representation(&mut self, representation: Representation) {
        self.w = self.w.take().map(|w| w.into_representation(representation));
        self.g = self.g.take().map(|g| g.into_representation(representation));
    }

    pub fn mem(&self) -> usize {
        let mut total = size_of::<Base>();
        if let Some(w) = &self.w {
            total += w.mem();
        }
        if let Some(g) = &self.g {
            total += g.mem();
        }
        total
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_i32(out, self.class_count as i32)?;
        binio::write_i32(out, self.first_class as i32)?;
        binio::write_i32(out, self.loss.tag())?;

        if self.class_count > 1 {
            let w = self
                .w
                .as_ref()
                .ok_or_else(|| Error::Model("trained node has no weights".to_owned()))?;
            // vector size and non-zero count let the loader pick a layout
            binio::write_u64(out, w.size() as u64)?;
            binio::write_u64(out, w.non_zero() as u64)?;
            w.save(out)?;
            match &self.g {
                Some(g) => {
                    binio::write_bool(out, true)?;
                    g.save(out)?;
                }
                None => binio::write_bool(out, false)?,
            }
        }
        Ok(())
    }

    pub fn load<R: Read>(
        input: &mut R,
        load_as: Representation,
        load_grads: bool,
    ) -> Result<Self> {
        let class_count = binio::read_i32(input)?;
        let first_class = binio::read_i32(input)?;
        let loss = Loss::from_tag(binio::read_i32(input)?)?;
        if !(0..=2).contains(&class_count) || !(0..=1).contains(&first_class) {
            return Err(Error::Model(format!(
                "node header out of range: classCount {}, firstClass {}",
                class_count, first_class
            )));
        }

        let mut base = Base {
            loss,
            class_count: class_count as u32,
            first_class: first_class as u32,
            first_class_count: 0,
            t: 0,
            w: None,
            g: None,
        };

        if class_count > 1 {
            let size = binio::read_u64(input)? as usize;
            let non_zero = binio::read_u64(input)? as usize;

            // Decide on the smallest representation in case of map
            let dense_mem = Weights::estimate_mem(Representation::Dense, size, non_zero);
            let map_mem = Weights::estimate_mem(Representation::Map, size, non_zero);
            let map_is_smaller = map_mem < dense_mem || size == 0;
            let target = match load_as {
                Representation::Map if map_is_smaller => Representation::Map,
                Representation::Sparse => Representation::Sparse,
                _ => Representation::Dense,
            };

            base.w = Some(Weights::load(input)?.into_representation(target));
            if binio::read_bool(input)? {
                let g = Weights::load(input)?;
                if load_grads {
                    base.g = Some(g.into_representation(target));
                }
            }
        }

        Ok(base)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        loss: Loss,
        class_count: u32,
        first_class: u32,
        w: Option<Weights>,
    ) -> Self {
        Self {
            loss,
            class_count,
            first_class,
            first_class_count: 0,
            t: 0,
            w,
            g: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervision<'a>(
        rows: &'a [Vec<(Index, Weight)>],
        labels: &[Weight],
        n_features: usize,
    ) -> TrainData<'a> {
        TrainData {
            n_features,
            labels: labels.to_vec(),
            features: rows.iter().map(|r| r.as_slice()).collect(),
            instance_weights: vec![1.0; labels.len()],
            dataset_rows: labels.len(),
            inv_ps: 1.0,
        }
    }

    fn separable_rows(n: usize) -> (Vec<Vec<(Index, Weight)>>, Vec<Weight>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let positive = i % 2 == 0;
            rows.push(vec![(1, 1.0), (2, if positive { 1.0 } else { -1.0 })]);
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        (rows, labels)
    }

    #[test]
    fn test_empty_supervision_never_activates() {
        let mut base = Base::new();
        base.train(supervision(&[], &[], 8), &Config::default()).unwrap();
        assert_eq!(0, base.class_count());
        assert!(base.weights().is_none());
        assert_eq!(-10.0, base.predict_value(&[(1, 1.0)]));
        assert!(base.predict_probability(&[(1, 1.0)]) < 0.001);
    }

    #[test]
    fn test_single_class_supervision() {
        let rows = vec![vec![(1, 1.0), (3, 2.0)], vec![(1, 1.0), (4, 1.0)]];

        let mut positive_only = Base::new();
        positive_only
            .train(supervision(&rows, &[1.0, 1.0], 8), &Config::default())
            .unwrap();
        assert_eq!(1, positive_only.class_count());
        assert_eq!(1, positive_only.first_class());
        assert!(positive_only.weights().is_none());
        // always activates, for every input
        assert!(positive_only.predict_probability(&[(7, -5.0)]) > 0.5);

        let mut negative_only = Base::new();
        negative_only
            .train(supervision(&rows, &[0.0, 0.0], 8), &Config::default())
            .unwrap();
        assert_eq!(1, negative_only.class_count());
        assert_eq!(0, negative_only.first_class());
        assert!(negative_only.predict_probability(&[(7, -5.0)]) < 0.5);
    }

    #[test]
    fn test_liblinear_training_separates() {
        let (rows, labels) = separable_rows(40);
        let mut base = Base::new();
        base.train(supervision(&rows, &labels, 3), &Config::default())
            .unwrap();

        assert_eq!(2, base.class_count());
        assert!(base.predict_probability(&[(1, 1.0), (2, 1.0)]) > 0.5);
        assert!(base.predict_probability(&[(1, 1.0), (2, -1.0)]) < 0.5);
    }

    #[test]
    fn test_online_training_separates() {
        let (rows, labels) = separable_rows(40);
        for &optimizer in &[Optimizer::Sgd, Optimizer::Adagrad] {
            let mut config = Config::default();
            config.optimizer = optimizer;
            config.epochs = 10;
            config.weights_threshold = 0.0;

            let mut base = Base::new();
            base.train(supervision(&rows, &labels, 3), &config).unwrap();

            assert_eq!(2, base.class_count());
            assert_eq!(1, base.first_class());
            // one update per example per epoch, half of them positive
            assert_eq!(400, base.updates());
            assert_eq!(200, base.first_class_count());
            assert!(base.predict_probability(&[(1, 1.0), (2, 1.0)]) > 0.5);
            assert!(base.predict_probability(&[(1, 1.0), (2, -1.0)]) < 0.5);
        }
    }

    #[test]
    fn test_tmax_caps_updates() {
        let (rows, labels) = separable_rows(40);
        let mut config = Config::default();
        config.optimizer = Optimizer::Sgd;
        config.epochs = 10;
        config.tmax = 5;

        let mut base = Base::new();
        base.train(supervision(&rows, &labels, 3), &config).unwrap();
        assert!(base.updates() <= 7);
    }

    #[test]
    fn test_prune_restores_bias() {
        let mut base = Base::new();
        base.setup_online_training(&Config::default(), 8, true);
        let w = base.w.as_mut().unwrap();
        w.set(1, 0.05);
        w.set(3, 0.01);
        w.set(5, 2.0);

        base.prune_weights(0.1);
        let w = base.weights().unwrap();
        assert_eq!(0.05, w.get(1));
        assert_eq!(0.0, w.get(3));
        assert_eq!(2.0, w.get(5));
    }

    #[test]
    fn test_set_first_class_preserves_predictions() {
        let (rows, labels) = separable_rows(40);
        let mut base = Base::new();
        base.train(supervision(&rows, &labels, 3), &Config::default())
            .unwrap();

        let features = [(1, 1.0), (2, 0.5)];
        let before = base.predict_value(&features);
        base.set_first_class(0);
        assert_eq!(0, base.first_class());
        assert_eq!(before, base.predict_value(&features));
        base.set_first_class(1);
        assert_eq!(before, base.predict_value(&features));
    }

    #[test]
    fn test_save_load_round_trip_is_bit_exact() {
        let (rows, labels) = separable_rows(40);
        let mut config = Config::default();
        config.optimizer = Optimizer::Adagrad;
        config.epochs = 5;
        config.weights_threshold = 0.0;

        let mut base = Base::new();
        base.train(supervision(&rows, &labels, 3), &config).unwrap();

        let mut buf = Vec::new();
        base.save(&mut buf).unwrap();
        let loaded = Base::load(&mut buf.as_slice(), Representation::Dense, false).unwrap();

        assert_eq!(base.class_count(), loaded.class_count());
        assert_eq!(base.first_class(), loaded.first_class());
        let features = [(1, 1.0), (2, -0.75)];
        assert_eq!(
            base.predict_value(&features).to_bits(),
            loaded.predict_value(&features).to_bits()
        );
    }

    #[test]
    fn test_degenerate_save_load_round_trip() {
        let mut base = Base::new();
        base.train(
            supervision(&[vec![(1, 1.0)]], &[1.0], 4),
            &Config::default(),
        )
        .unwrap();

        let mut buf = Vec::new();
        base.save(&mut buf).unwrap();
        // single-class nodes carry no weight payload
        assert_eq!(12, buf.len());

        let loaded = Base::load(&mut buf.as_slice(), Representation::Map, false).unwrap();
        assert_eq!(1, loaded.class_count());
        assert_eq!(1, loaded.first_class());
        assert!(loaded.predict_probability(&[(2, 1.0)]) > 0.5);
    }
}
