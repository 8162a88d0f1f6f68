use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

/// How the tree structure is obtained when no structure file is given.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Serialize, Deserialize)]
pub enum TreeKind {
    CompleteInOrder,
    CompleteRandom,
}

impl FromStr for TreeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completeInOrder" => Ok(TreeKind::CompleteInOrder),
            "completeRandom" => Ok(TreeKind::CompleteRandom),
            _ => Err(Error::Config(format!("unknown tree type: {}", s))),
        }
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Serialize, Deserialize)]
pub enum Optimizer {
    Liblinear,
    Sgd,
    Adagrad,
}

impl FromStr for Optimizer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "liblinear" => Ok(Optimizer::Liblinear),
            "sgd" => Ok(Optimizer::Sgd),
            "adagrad" => Ok(Optimizer::Adagrad),
            _ => Err(Error::Config(format!("unknown optimizer: {}", s))),
        }
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Serialize, Deserialize)]
pub enum Loss {
    /// Log loss; predictions map to probabilities through the sigmoid.
    Logistic,
    /// Squared hinge loss; predictions map through exp(-max(0, 1 - v)^2).
    SquaredHinge,
    /// Propensity-weighted log loss for online training.
    PwLogistic,
}

impl Loss {
    /// Stable numeric tag used in node files.
    pub(crate) fn tag(self) -> i32 {
        match self {
            Loss::Logistic => 0,
            Loss::SquaredHinge => 1,
            Loss::PwLogistic => 2,
        }
    }

    pub(crate) fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Loss::Logistic),
            1 => Ok(Loss::SquaredHinge),
            2 => Ok(Loss::PwLogistic),
            _ => Err(Error::Model(format!("unknown loss tag: {}", tag))),
        }
    }
}

impl FromStr for Loss {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "logistic" => Ok(Loss::Logistic),
            "squaredHinge" => Ok(Loss::SquaredHinge),
            "pwLogistic" => Ok(Loss::PwLogistic),
            _ => Err(Error::Config(format!("unknown loss: {}", s))),
        }
    }
}

/// Physical layout weight vectors are materialised in at load time.
///
/// `Map` picks the smaller of map and dense per vector, mirroring the
/// estimate-driven choice made when a model is read back.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Serialize, Deserialize)]
pub enum Representation {
    Dense,
    Sparse,
    Map,
}

impl FromStr for Representation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dense" => Ok(Representation::Dense),
            "sparse" => Ok(Representation::Sparse),
            "map" => Ok(Representation::Map),
            _ => Err(Error::Config(format!("unknown representation: {}", s))),
        }
    }
}

/// All run settings. Persisted to `args.bin` in the model directory so that
/// test and predict runs see the exact training-time settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub threads: usize,
    pub arity: usize,
    /// Optional tree structure file; takes precedence over `tree_kind`.
    pub tree_file: Option<String>,
    pub tree_kind: TreeKind,
    pub optimizer: Optimizer,
    pub loss: Loss,
    pub epochs: u32,
    pub eta: f64,
    pub weights_threshold: f64,
    pub top_k: usize,
    /// Online update budget per node; -1 means unlimited.
    pub tmax: i64,
    pub cost: f64,
    pub eps: f64,
    pub max_iter: u32,
    pub inbalance_labels_weighting: bool,
    pub auto_c_lin: bool,
    pub auto_c_log: bool,
    pub load_as: Representation,
    /// Seed for random leaf assignment; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 1,
            arity: 2,
            tree_file: None,
            tree_kind: TreeKind::CompleteInOrder,
            optimizer: Optimizer::Liblinear,
            loss: Loss::Logistic,
            epochs: 1,
            eta: 1.0,
            weights_threshold: 0.1,
            top_k: 5,
            tmax: -1,
            cost: 10.0,
            eps: 0.1,
            max_iter: 100,
            inbalance_labels_weighting: false,
            auto_c_lin: false,
            auto_c_log: false,
            load_as: Representation::Map,
            seed: None,
        }
    }
}

impl Config {
    /// Check that the settings describe a runnable configuration.
    pub fn validate(&self) -> Result<()> {
        if self.arity < 2 {
            Err(Error::Config(format!(
                "arity must be at least 2, but is {}",
                self.arity
            )))
        } else if self.eps <= 0.0 {
            Err(Error::Config(format!(
                "eps must be positive, but is {}",
                self.eps
            )))
        } else if self.cost <= 0.0 {
            Err(Error::Config(format!(
                "cost must be positive, but is {}",
                self.cost
            )))
        } else if self.eta <= 0.0 {
            Err(Error::Config(format!(
                "eta must be positive, but is {}",
                self.eta
            )))
        } else if self.epochs == 0 {
            Err(Error::Config("epochs must be positive".to_owned()))
        } else if self.max_iter == 0 {
            Err(Error::Config("maxIter must be positive".to_owned()))
        } else if self.top_k == 0 {
            Err(Error::Config("topK must be positive".to_owned()))
        } else if self.optimizer == Optimizer::Liblinear && self.loss == Loss::PwLogistic {
            Err(Error::Config(
                "pwLogistic loss is only available with online optimizers".to_owned(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}
