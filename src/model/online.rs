//! Loss gradients and coordinate update rules for the online training path.
//!
//! Binary labels are 0.0/1.0; gradients are taken with respect to the raw
//! prediction `w . x` and scaled by per-instance weights at the call site.

use crate::config::{Config, Loss, Optimizer};
use crate::model::vector::Weights;
use crate::{Index, Weight};

const ADAGRAD_EPS: Weight = 1e-6;

pub(crate) fn sigmoid(v: Weight) -> Weight {
    1.0 / (1.0 + (-v).exp())
}

pub(crate) type GradFn = fn(Weight, Weight, Weight) -> Weight;

fn logistic_grad(label: Weight, pred: Weight, _inv_ps: Weight) -> Weight {
    sigmoid(pred) - label
}

fn squared_hinge_grad(label: Weight, pred: Weight, _inv_ps: Weight) -> Weight {
    let sign = 2.0 * label - 1.0;
    let margin = 1.0 - sign * pred;
    if margin > 0.0 {
        -2.0 * sign * margin
    } else {
        0.0
    }
}

/// Logistic gradient with positives re-weighted by the inverse propensity.
fn pw_logistic_grad(label: Weight, pred: Weight, inv_ps: Weight) -> Weight {
    let grad = sigmoid(pred) - label;
    if label > 0.0 {
        grad * inv_ps
    } else {
        grad
    }
}

pub(crate) fn grad_fn(loss: Loss) -> GradFn {
    match loss {
        Loss::Logistic => logistic_grad,
        Loss::SquaredHinge => squared_hinge_grad,
        Loss::PwLogistic => pw_logistic_grad,
    }
}

pub(crate) type UpdateFn =
    fn(&mut Weights, Option<&mut Weights>, &[(Index, Weight)], Weight, u64, &Config);

fn update_sgd(
    w: &mut Weights,
    _grads: Option<&mut Weights>,
    features: &[(Index, Weight)],
    grad: Weight,
    t: u64,
    config: &Config,
) {
    let lr = config.eta * (1.0 / t as Weight).sqrt();
    for &(i, v) in features {
        w.update(i, -lr * grad * v);
    }
}

fn update_adagrad(
    w: &mut Weights,
    grads: Option<&mut Weights>,
    features: &[(Index, Weight)],
    grad: Weight,
    _t: u64,
    config: &Config,
) {
    let grads = grads.expect("AdaGrad requires a gradient accumulator");
    for &(i, v) in features {
        let gi = grad * v;
        grads.update(i, gi * gi);
        let lr = config.eta / (ADAGRAD_EPS + grads.get(i).sqrt());
        w.update(i, -lr * gi);
    }
}

pub(crate) fn update_fn(optimizer: Optimizer) -> UpdateFn {
    match optimizer {
        Optimizer::Sgd => update_sgd,
        Optimizer::Adagrad => update_adagrad,
        Optimizer::Liblinear => unreachable!("liblinear is not an online optimizer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logistic_grad_signs() {
        // confident correct predictions give near-zero gradients
        assert!(logistic_grad(1.0, 10.0, 1.0).abs() < 1e-4);
        assert!(logistic_grad(0.0, -10.0, 1.0).abs() < 1e-4);
        // wrong predictions push in the right direction
        assert!(logistic_grad(1.0, -10.0, 1.0) < -0.99);
        assert!(logistic_grad(0.0, 10.0, 1.0) > 0.99);
    }

    #[test]
    fn test_squared_hinge_grad_zero_past_margin() {
        assert_eq!(0.0, squared_hinge_grad(1.0, 1.5, 1.0));
        assert_eq!(0.0, squared_hinge_grad(0.0, -1.5, 1.0));
        assert!(squared_hinge_grad(1.0, 0.0, 1.0) < 0.0);
        assert!(squared_hinge_grad(0.0, 0.0, 1.0) > 0.0);
    }

    #[test]
    fn test_pw_logistic_scales_positives_only() {
        let base = logistic_grad(1.0, 0.0, 1.0);
        assert_eq!(base * 3.0, pw_logistic_grad(1.0, 0.0, 3.0));
        assert_eq!(
            logistic_grad(0.0, 0.0, 1.0),
            pw_logistic_grad(0.0, 0.0, 3.0)
        );
    }

    #[test]
    fn test_sgd_moves_against_gradient() {
        let mut w = Weights::new_dense(4);
        let config = Config::default();
        update_sgd(&mut w, None, &[(1, 1.0), (2, 2.0)], 0.5, 1, &config);
        assert!(w.get(1) < 0.0);
        assert!(w.get(2) < w.get(1));
        assert_eq!(0.0, w.get(3));
    }

    #[test]
    fn test_adagrad_accumulates_squared_gradients() {
        let mut w = Weights::new_dense(4);
        let mut g = Weights::new_dense(4);
        let config = Config::default();
        update_adagrad(&mut w, Some(&mut g), &[(1, 2.0)], 0.5, 1, &config);
        assert_eq!(1.0, g.get(1));
        assert!(w.get(1) < 0.0);

        // a second identical step shrinks because the accumulator grew
        let first_step = w.get(1);
        update_adagrad(&mut w, Some(&mut g), &[(1, 2.0)], 0.5, 2, &config);
        assert!((w.get(1) - first_step).abs() < first_step.abs());
    }
}
