use crate::config::Config;
use crate::data::DataSet;
use crate::error::{Error, Result};
use crate::model::{Model, Prediction};
use crate::util::{create_progress_bar, elapsed_secs};
use crate::Label;
use log::info;
use rayon::prelude::*;
use std::sync::Mutex;
use std::time::Instant;

/// Predict the top-K labels for every row, in row order.
pub fn predict_all(model: &Model, dataset: &DataSet, config: &Config) -> Result<Vec<Vec<Prediction>>> {
    let rows = dataset.rows();
    let start_t = Instant::now();
    let pb = Mutex::new(create_progress_bar(rows as u64));

    let predict_row = |features: &crate::IndexValueVec| {
        let predictions = model.predict(features, config.top_k);
        pb.lock().expect("Failed to lock progress bar").inc();
        predictions
    };

    let predictions = if config.threads > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| Error::Config(format!("failed to build thread pool: {}", e)))?;
        pool.install(|| {
            dataset
                .feature_lists
                .par_iter()
                .map(predict_row)
                .collect::<Vec<_>>()
        })
    } else {
        dataset.feature_lists.iter().map(predict_row).collect()
    };
    pb.into_inner().expect("Failed to unwrap progress bar").finish();

    info!(
        "Predicted {} examples; it took {:.2}s",
        rows,
        elapsed_secs(&start_t)
    );
    Ok(predictions)
}

/// Cumulative precision at 1..=top_k, tallied in one pass after all
/// prediction workers have finished.
fn precision_at_k(
    top_k: usize,
    true_labels: &[Vec<Label>],
    predicted_labels: &[Vec<Prediction>],
) -> Vec<f64> {
    assert_eq!(true_labels.len(), predicted_labels.len());

    let mut hits = vec![0u64; top_k];
    for (truth, predictions) in true_labels.iter().zip(predicted_labels) {
        for (k, &(label, _)) in predictions.iter().take(top_k).enumerate() {
            if truth.contains(&label) {
                hits[k] += 1;
            }
        }
    }

    let rows = true_labels.len() as f64;
    let mut correct = 0u64;
    hits.iter()
        .enumerate()
        .map(|(k, &h)| {
            correct += h;
            correct as f64 / (rows * (k + 1) as f64)
        })
        .collect()
}

/// Run prediction over a test set and report precision at 1..=top_k.
pub fn test_all(
    model: &Model,
    dataset: &DataSet,
    config: &Config,
) -> Result<(Vec<Vec<Prediction>>, Vec<f64>)> {
    info!("Starting testing ...");
    let predictions = predict_all(model, dataset, config)?;

    let precisions = precision_at_k(config.top_k, &dataset.label_lists, &predictions);
    for (k, p) in precisions.iter().enumerate() {
        info!("P@{}: {:.4}", k + 1, p);
    }

    Ok((predictions, precisions))
}
