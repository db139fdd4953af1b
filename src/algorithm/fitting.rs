use nalgebra::{DMatrix, DVector};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::debug;

use crate::algorithm::peak_model::{PeakModel, PeakParams};
use crate::data::trace::Trace;

/// Damping and termination settings for the least-squares solver.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative cost improvement below which the fit counts as converged.
    pub cost_tolerance: f64,
    pub damping_init: f64,
    pub damping_scale: f64,
    /// Damping ceiling; crossing it surfaces a fit error.
    pub damping_max: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            max_iterations: 100,
            cost_tolerance: 1e-10,
            damping_init: 1e-3,
            damping_scale: 10.0,
            damping_max: 1e12,
        }
    }
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("window holds {samples} samples but the fit has {parameters} free parameters")]
    InsufficientData { samples: usize, parameters: usize },
    #[error("normal equations became singular at damping {damping:e}")]
    SingularSystem { damping: f64 },
    #[error("fit did not converge within {iterations} iterations")]
    DidNotConverge { iterations: usize },
}

/// Proposes starting parameters for one candidate peak.
///
/// # Description
///
/// Least-squares fitting is only locally convergent, so the search is
/// anchored at the observed amplitude nearest `location`, with a width a
/// small fraction of the window span and a decay rate matched to the width.
pub fn estimate_initial(trace: &Trace, location: f64) -> PeakParams {
    let total = trace.total_intensity();
    let nearest = nearest_index(&trace.times, location);
    let h = nearest.and_then(|index| total.get(index).copied()).unwrap_or(0.0);
    let span = trace.span().map(|(first, last)| last - first).unwrap_or(0.0);
    let w = if span > 0.0 { 0.05 * span } else { 1.0 };
    PeakParams { x: location, w, h, a: 1.0 / w }
}

fn nearest_index(times: &[f64], location: f64) -> Option<usize> {
    if times.is_empty() {
        return None;
    }
    let after = times.partition_point(|&t| t < location);
    if after == 0 {
        return Some(0);
    }
    if after >= times.len() {
        return Some(times.len() - 1);
    }
    if (times[after] - location).abs() < (location - times[after - 1]).abs() {
        Some(after)
    } else {
        Some(after - 1)
    }
}

/// Jointly fits a sum of `initial.len()` peak-model instances against the
/// observed signal.
///
/// # Description
///
/// Levenberg-Marquardt on a finite-difference Jacobian: damped normal
/// equations are solved per step and the damping factor rises until a step
/// reduces the cost. Returns one converged parameter set per component, in
/// input order. Non-convergence and singular systems are surfaced as errors
/// and are never retried here.
pub fn fit_peak_sum(
    times: &[f64],
    observed: &[f64],
    model: PeakModel,
    initial: &[PeakParams],
    options: &FitOptions,
) -> Result<Vec<PeakParams>, FitError> {
    let k = model.param_count();
    let parameters = initial.len() * k;
    if parameters == 0 || times.len() < parameters {
        return Err(FitError::InsufficientData { samples: times.len(), parameters });
    }

    let mut v = pack(initial, k);
    let mut r = residual(times, observed, model, &v, k);
    let mut cost = r.norm_squared();
    let mut damping = options.damping_init;

    for iteration in 0..options.max_iterations {
        let jacobian = numeric_jacobian(times, observed, model, &v, k);
        let jt = jacobian.transpose();
        let gradient = &jt * &r;
        let hessian = &jt * &jacobian;

        // raise damping until a cost-reducing step comes out
        loop {
            let mut damped = hessian.clone();
            for i in 0..parameters {
                damped[(i, i)] += damping * hessian[(i, i)].max(f64::EPSILON);
            }
            let step = match damped.lu().solve(&gradient) {
                Some(step) => step,
                None => {
                    damping *= options.damping_scale;
                    if damping > options.damping_max {
                        return Err(FitError::SingularSystem { damping });
                    }
                    continue;
                }
            };

            let candidate = &v + &step;
            let candidate_r = residual(times, observed, model, &candidate, k);
            let candidate_cost = candidate_r.norm_squared();
            if candidate_cost <= cost {
                let improvement = cost - candidate_cost;
                v = candidate;
                r = candidate_r;
                cost = candidate_cost;
                damping = (damping / options.damping_scale).max(1e-12);
                if improvement <= options.cost_tolerance * cost.max(options.cost_tolerance) {
                    debug!(iteration, cost, "least squares fit converged");
                    return Ok(unpack(&v, k));
                }
                break;
            }

            damping *= options.damping_scale;
            if damping > options.damping_max {
                return Err(FitError::DidNotConverge { iterations: iteration + 1 });
            }
        }
    }

    Err(FitError::DidNotConverge { iterations: options.max_iterations })
}

fn pack(params: &[PeakParams], k: usize) -> DVector<f64> {
    let mut v = DVector::zeros(params.len() * k);
    for (i, p) in params.iter().enumerate() {
        v[i * k] = p.x;
        v[i * k + 1] = p.w;
        v[i * k + 2] = p.h;
        if k == 4 {
            v[i * k + 3] = p.a;
        }
    }
    v
}

fn unpack(v: &DVector<f64>, k: usize) -> Vec<PeakParams> {
    v.as_slice()
        .chunks(k)
        .map(|chunk| PeakParams {
            x: chunk[0],
            w: chunk[1],
            h: chunk[2],
            a: if k == 4 { chunk[3] } else { 0.0 },
        })
        .collect()
}

fn residual(times: &[f64], observed: &[f64], model: PeakModel, v: &DVector<f64>, k: usize) -> DVector<f64> {
    let mut r = DVector::from_column_slice(observed);
    for params in unpack(v, k) {
        for (i, &t) in times.iter().enumerate() {
            r[i] -= model.evaluate_at(t, &params);
        }
    }
    r
}

fn numeric_jacobian(times: &[f64], observed: &[f64], model: PeakModel, v: &DVector<f64>, k: usize) -> DMatrix<f64> {
    let rows = times.len();
    let cols = v.len();
    let base = residual(times, observed, model, v, k);
    let mut jacobian = DMatrix::zeros(rows, cols);
    for col in 0..cols {
        let eps = 1e-6 * v[col].abs().max(1e-6);
        let mut shifted = v.clone();
        shifted[col] += eps;
        let shifted_r = residual(times, observed, model, &shifted, k);
        for row in 0..rows {
            jacobian[(row, col)] = (shifted_r[row] - base[row]) / eps;
        }
    }
    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::trace::ChannelId;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn grid(n: usize, step: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * step).collect()
    }

    fn gaussian_sum(times: &[f64], components: &[PeakParams]) -> Vec<f64> {
        times.iter()
            .map(|&t| components.iter().map(|p| PeakModel::Gaussian.evaluate_at(t, p)).sum())
            .collect()
    }

    #[test]
    fn test_estimate_initial_reads_amplitude_from_trace() {
        let trace = Trace::single(
            ChannelId::Total,
            vec![0.0, 1.0, 2.0, 3.0, 4.0],
            vec![0.0, 1.0, 6.0, 1.0, 0.0],
        );
        let guess = estimate_initial(&trace, 2.1);
        assert_eq!(guess.x, 2.1);
        assert_eq!(guess.h, 6.0);
        assert!(guess.w > 0.0);
    }

    #[test]
    fn test_fit_recovers_single_gaussian() {
        let times = grid(101, 0.1);
        let truth = PeakParams::new(5.0, 0.8, 10.0);
        let observed = gaussian_sum(&times, &[truth]);
        let init = PeakParams::new(4.8, 1.0, 8.0);

        let fitted = fit_peak_sum(&times, &observed, PeakModel::Gaussian, &[init], &FitOptions::default()).unwrap();
        assert_eq!(fitted.len(), 1);
        assert!((fitted[0].x - truth.x).abs() < 0.01 * truth.x.abs().max(1.0));
        assert!((fitted[0].w.abs() - truth.w).abs() < 0.01 * truth.w);
        assert!((fitted[0].h - truth.h).abs() < 0.01 * truth.h);
    }

    #[test]
    fn test_fit_recovers_two_overlapping_gaussians() {
        let times = grid(101, 0.1);
        let truth = [PeakParams::new(4.0, 0.6, 8.0), PeakParams::new(5.5, 0.7, 5.0)];
        let observed = gaussian_sum(&times, &truth);
        let init = [PeakParams::new(3.8, 0.8, 7.0), PeakParams::new(5.8, 0.8, 4.0)];

        let fitted = fit_peak_sum(&times, &observed, PeakModel::Gaussian, &init, &FitOptions::default()).unwrap();
        assert_eq!(fitted.len(), 2);
        assert!((fitted[0].x - 4.0).abs() < 0.05);
        assert!((fitted[1].x - 5.5).abs() < 0.05);
    }

    #[test]
    fn test_fit_tolerates_noise() {
        let mut rng = StdRng::seed_from_u64(7);
        let times = grid(101, 0.1);
        let truth = PeakParams::new(5.0, 0.8, 10.0);
        let observed: Vec<f64> = gaussian_sum(&times, &[truth])
            .into_iter()
            .map(|y| y + rng.gen_range(-0.05..0.05))
            .collect();
        let init = PeakParams::new(4.5, 1.0, 8.0);

        let fitted = fit_peak_sum(&times, &observed, PeakModel::Gaussian, &[init], &FitOptions::default()).unwrap();
        assert!((fitted[0].x - truth.x).abs() < 0.05);
        assert!((fitted[0].h - truth.h).abs() < 0.5);
    }

    #[test]
    fn test_fit_rejects_underdetermined_window() {
        let times = vec![0.0, 1.0];
        let observed = vec![1.0, 2.0];
        let init = PeakParams::new(0.5, 1.0, 1.0);

        let result = fit_peak_sum(&times, &observed, PeakModel::Gaussian, &[init], &FitOptions::default());
        assert!(matches!(result, Err(FitError::InsufficientData { samples: 2, parameters: 3 })));
    }

    #[test]
    fn test_fit_accepts_exact_initial_conditions() {
        let times = grid(101, 0.1);
        let truth = PeakParams::new(5.0, 0.8, 10.0);
        let observed = gaussian_sum(&times, &[truth]);

        let fitted = fit_peak_sum(&times, &observed, PeakModel::Gaussian, &[truth], &FitOptions::default()).unwrap();
        assert!((fitted[0].x - truth.x).abs() < 1e-6);
    }
}
