use crate::error::{Error, Result};
use crate::util::{create_progress_bar, elapsed_secs};
use crate::{Index, IndexValueVec, Label, Weight};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

/// Feature id 0 is never used; id 1 carries a constant 1.0 bias value, so ids
/// from input files start at `FEATURE_OFFSET`.
pub const BIAS_FEATURE: Index = 1;
pub const FEATURE_OFFSET: Index = 2;

pub struct DataSet {
    /// Number of feature columns, including the two reserved ids.
    pub n_features: usize,
    pub n_labels: usize,
    pub feature_lists: Vec<IndexValueVec>,
    /// Per-row labels in file order; may be empty for unlabelled rows.
    pub label_lists: Vec<Vec<Label>>,
}

impl DataSet {
    /// Parse a line in a data file from the Extreme Classification Repository
    ///
    /// The line should be in the following format:
    /// label1,label2,...labelk ft1:ft1_val ft2:ft2_val ft3:ft3_val .. ftd:ftd_val
    ///
    /// Feature ids are shifted by `FEATURE_OFFSET` and the bias entry is
    /// prepended, so every returned row starts with `(BIAS_FEATURE, 1.0)`.
    fn parse_xc_repo_data_line(line: &str) -> Result<(Vec<Label>, IndexValueVec)> {
        let invalid = || Error::Data(format!("malformed data line: {:?}", line));

        let mut token_iter = line.split(' ');

        let mut labels = Vec::new();
        let labels_str = token_iter.next().ok_or_else(invalid)?;
        for label_str in labels_str.split(',') {
            if !label_str.is_empty() {
                labels.push(label_str.parse::<Label>().map_err(|_| invalid())?);
            }
        }

        let mut features: IndexValueVec = vec![(BIAS_FEATURE, 1.0)];
        for feature_value_pair_str in token_iter {
            if feature_value_pair_str.is_empty() {
                continue;
            }
            let mut pair_iter = feature_value_pair_str.split(':');
            let feature = pair_iter
                .next()
                .and_then(|s| s.parse::<Index>().ok())
                .ok_or_else(invalid)?;
            let value = pair_iter
                .next()
                .and_then(|s| s.parse::<Weight>().ok())
                .ok_or_else(invalid)?;
            if pair_iter.next().is_some() {
                return Err(invalid());
            }
            features.push((feature + FEATURE_OFFSET, value));
        }
        features[1..].sort_unstable_by_key(|&(i, _)| i);
        features.shrink_to_fit();

        Ok((labels, features))
    }

    /// Load a data file from the Extreme Classification Repository
    pub fn load_xc_repo_data_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading data from {}", path.display());
        let start_t = Instant::now();

        let mut lines = BufReader::new(File::open(path)?).lines();

        let (n_examples, n_features, n_labels) = {
            let header_line = lines
                .next()
                .ok_or_else(|| Error::Data("empty data file".to_owned()))??;
            let mut token_iter = header_line.split_whitespace();
            let mut next_count = || {
                token_iter
                    .next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| Error::Data(format!("malformed header: {:?}", header_line)))
            };
            (next_count()?, next_count()?, next_count()?)
        };

        let n_columns = n_features + FEATURE_OFFSET as usize;
        let mut pb = create_progress_bar(n_examples as u64);
        let mut feature_lists = Vec::with_capacity(n_examples);
        let mut label_lists = Vec::with_capacity(n_examples);
        for line in lines {
            let (labels, features) = Self::parse_xc_repo_data_line(&line?)?;
            if !is_valid_sparse_row(&features, n_columns) {
                return Err(Error::Data(format!(
                    "row {} has duplicate or out-of-range feature ids",
                    feature_lists.len()
                )));
            }
            feature_lists.push(features);
            label_lists.push(labels);
            pb.inc();
        }
        pb.finish();

        if n_examples != feature_lists.len() {
            return Err(Error::Data(format!(
                "expected {} examples, read {} lines",
                n_examples,
                feature_lists.len()
            )));
        }

        info!(
            "Loaded {} examples; it took {:.2}s",
            n_examples,
            elapsed_secs(&start_t)
        );
        Ok(Self {
            n_features: n_columns,
            n_labels,
            feature_lists,
            label_lists,
        })
    }

    /// Widen this dataset's declared dimensions to those recorded at training
    /// time, so test rows index into the trained weight space.
    pub fn align_to(&mut self, reader: &DataReader) {
        self.n_features = self.n_features.max(reader.n_features);
        self.n_labels = self.n_labels.max(reader.n_labels);
    }

    pub fn rows(&self) -> usize {
        self.feature_lists.len()
    }
}

/// Ids strictly increasing and within the column count.
fn is_valid_sparse_row(row: &[(Index, Weight)], n_columns: usize) -> bool {
    row.windows(2).all(|pair| pair[0].0 < pair[1].0)
        && row.last().map_or(true, |&(i, _)| (i as usize) < n_columns)
}

/// Dataset shape captured at training time and persisted to
/// `data_reader.bin` in the model directory.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataReader {
    pub n_features: usize,
    pub n_labels: usize,
}

impl DataReader {
    pub fn from_dataset(dataset: &DataSet) -> Self {
        Self {
            n_features: dataset.n_features,
            n_labels: dataset.n_labels,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xc_repo_data_line() {
        let (labels, features) = DataSet::parse_xc_repo_data_line("11,12 21:1 23:2 24:3").unwrap();
        assert_eq!(vec![11, 12], labels);
        assert_eq!(
            vec![(1, 1.0), (23, 1.0), (25, 2.0), (26, 3.0)],
            features
        );
    }

    #[test]
    fn test_parse_label_less_line() {
        let (labels, features) = DataSet::parse_xc_repo_data_line(" 3:0.5").unwrap();
        assert!(labels.is_empty());
        assert_eq!(vec![(1, 1.0), (5, 0.5)], features);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DataSet::parse_xc_repo_data_line("1 2:3:4").is_err());
        assert!(DataSet::parse_xc_repo_data_line("x 2:3").is_err());
    }

    #[test]
    fn test_load_rejects_out_of_range_feature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.txt");
        std::fs::write(&path, "1 10 4\n0 20:1\n").unwrap();
        assert!(DataSet::load_xc_repo_data_file(&path).is_err());
    }

    #[test]
    fn test_load_checks_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.txt");
        std::fs::write(&path, "3 10 4\n0 1:1\n1,2 2:1\n").unwrap();
        assert!(DataSet::load_xc_repo_data_file(&path).is_err());
    }

    #[test]
    fn test_load_and_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.txt");
        std::fs::write(&path, "2 10 4\n0 1:1 4:2\n1,2 2:1\n").unwrap();

        let dataset = DataSet::load_xc_repo_data_file(&path).unwrap();
        assert_eq!(2, dataset.rows());
        assert_eq!(12, dataset.n_features);
        assert_eq!(4, dataset.n_labels);
        assert_eq!(vec![(1, 1.0), (3, 1.0), (6, 2.0)], dataset.feature_lists[0]);
        assert_eq!(vec![1, 2], dataset.label_lists[1]);

        let reader_path = dir.path().join("data_reader.bin");
        DataReader::from_dataset(&dataset).save(&reader_path).unwrap();
        let reader = DataReader::load(&reader_path).unwrap();
        assert_eq!(12, reader.n_features);
        assert_eq!(4, reader.n_labels);
    }
}
