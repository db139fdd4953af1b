use std::collections::BTreeMap;
use std::f64::consts::SQRT_2;

use bincode::{Decode, Encode};
use serde::{Serialize, Deserialize};
use statrs::function::erf::erfc;

/// Parameter set for a single peak component.
///
/// `x` is the center, `w` the width, `h` the height. `a` is the exponential
/// decay rate of the EMG tail; symmetric shapes ignore it. Width and decay
/// enter the shapes through their absolute values, so a solver may roam
/// either sign freely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct PeakParams {
    pub x: f64,
    pub w: f64,
    pub h: f64,
    pub a: f64,
}

impl PeakParams {
    pub fn new(x: f64, w: f64, h: f64) -> Self {
        PeakParams { x, w, h, a: 0.0 }
    }

    pub fn with_decay(x: f64, w: f64, h: f64, a: f64) -> Self {
        PeakParams { x, w, h, a }
    }
}

/// A synthetic peak shape used for forward evaluation during fitting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum PeakModel {
    Gaussian,
    Lorentzian,
    /// Exponentially-modified Gaussian.
    Emg,
}

impl PeakModel {
    /// The registry name of this shape.
    pub fn name(&self) -> &'static str {
        match self {
            PeakModel::Gaussian => "gaussian",
            PeakModel::Lorentzian => "lorentzian",
            PeakModel::Emg => "emg",
        }
    }

    /// Number of free parameters the shape exposes to a fit.
    pub fn param_count(&self) -> usize {
        match self {
            PeakModel::Gaussian | PeakModel::Lorentzian => 3,
            PeakModel::Emg => 4,
        }
    }

    /// Evaluates the shape at a single time point.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chromcore::algorithm::peak_model::{PeakModel, PeakParams};
    /// let params = PeakParams::new(10.0, 1.0, 3.0);
    /// assert_eq!(PeakModel::Gaussian.evaluate_at(10.0, &params), 3.0);
    /// ```
    pub fn evaluate_at(&self, t: f64, params: &PeakParams) -> f64 {
        let w = params.w.abs().max(f64::EPSILON);
        match self {
            PeakModel::Gaussian => params.h * (-0.5 * ((t - params.x) / w).powi(2)).exp(),
            PeakModel::Lorentzian => params.h * w * w / ((t - params.x).powi(2) + w * w),
            PeakModel::Emg => {
                let lambda = params.a.abs().max(f64::EPSILON);
                let prefactor = params.h * lambda / 2.0
                    * ((lambda / 2.0) * (2.0 * params.x + lambda * w.powi(2) - 2.0 * t)).exp();
                prefactor * erfc((params.x + lambda * w.powi(2) - t) / (SQRT_2 * w))
            }
        }
    }

    /// Evaluates the shape over a time grid.
    pub fn evaluate(&self, times: &[f64], params: &PeakParams) -> Vec<f64> {
        times.iter().map(|&t| self.evaluate_at(t, params)).collect()
    }
}

/// By-name table of peak shapes available to the least-squares integrator.
///
/// # Description
///
/// The registry is owned by the caller and passed to the integrator
/// explicitly; there is no process-wide model list. Lookup is spelling-exact.
#[derive(Clone, Debug)]
pub struct PeakModelRegistry {
    models: BTreeMap<String, PeakModel>,
}

impl PeakModelRegistry {
    /// A registry with no shapes registered.
    pub fn empty() -> Self {
        PeakModelRegistry { models: BTreeMap::new() }
    }

    /// Registers a shape under its canonical name.
    pub fn register(&mut self, model: PeakModel) {
        self.models.insert(model.name().to_string(), model);
    }

    pub fn get(&self, name: &str) -> Option<PeakModel> {
        self.models.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(|name| name.as_str())
    }
}

/// Registers the built-in shapes.
impl Default for PeakModelRegistry {
    fn default() -> Self {
        let mut registry = PeakModelRegistry::empty();
        registry.register(PeakModel::Gaussian);
        registry.register(PeakModel::Lorentzian);
        registry.register(PeakModel::Emg);
        registry
    }
}
