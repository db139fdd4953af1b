use std::collections::BTreeMap;

use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::algorithm::fitting::{estimate_initial, fit_peak_sum, FitError, FitOptions};
use crate::algorithm::peak_model::{PeakModelRegistry, PeakParams};
use crate::data::feature::{BoundaryProposal, FeatureDraft};
use crate::data::trace::{ChannelId, Trace};

/// Features whose centers lie closer than this are the same physical peak
/// observed on different ion channels.
const ION_COINCIDENCE_WINDOW: f64 = 0.01;

#[derive(Debug, Error)]
pub enum IntegrateError {
    #[error("no peak model named {0:?} is registered")]
    UnknownPeakModel(String),
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// A maximal cluster of time-overlapping boundary proposals.
///
/// Windows partition a proposal list; no proposal in one window overlaps any
/// proposal in another, so windows can be processed independently.
#[derive(Clone, Debug, PartialEq)]
pub struct Window {
    /// Union time-range of all member proposals.
    pub span: (f64, f64),
    pub members: Vec<BoundaryProposal>,
}

/// Groups proposals into maximal overlap clusters.
///
/// # Description
///
/// Overlap is inclusive and closed transitively: a proposal that bridges two
/// earlier clusters merges them into a single window regardless of input
/// order. Windows come out ordered by their first member's position in the
/// input and members keep their input order.
///
/// # Example
///
/// ```rust
/// use chromcore::algorithm::integrate::bin_windows;
/// use chromcore::data::feature::BoundaryProposal;
///
/// let windows = bin_windows(&[
///     BoundaryProposal::new(0.0, 2.0),
///     BoundaryProposal::new(1.0, 3.0),
///     BoundaryProposal::new(5.0, 6.0),
/// ]);
/// assert_eq!(windows.len(), 2);
/// assert_eq!(windows[0].members.len(), 2);
/// assert_eq!(windows[0].span, (0.0, 3.0));
/// ```
pub fn bin_windows(proposals: &[BoundaryProposal]) -> Vec<Window> {
    let mut parent: Vec<usize> = (0..proposals.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..proposals.len() {
        for j in 0..i {
            let (a, b) = (&proposals[i], &proposals[j]);
            if a.t_start <= b.t_end && a.t_end >= b.t_start {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    // the smaller index stays root, keeping first-seen window order
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut windows: Vec<Window> = Vec::new();
    let mut slots: BTreeMap<usize, usize> = BTreeMap::new();
    for (i, proposal) in proposals.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = *slots.entry(root).or_insert_with(|| {
            windows.push(Window { span: (proposal.t_start, proposal.t_end), members: Vec::new() });
            windows.len() - 1
        });
        let window = &mut windows[slot];
        window.span.0 = window.span.0.min(proposal.t_start);
        window.span.1 = window.span.1.max(proposal.t_end);
        window.members.push(proposal.clone());
    }

    debug!(proposals = proposals.len(), windows = windows.len(), "binned boundary proposals");
    windows
}

/// Integrates each proposal naively, without regard to overlap.
///
/// # Description
///
/// The payload is the combined-channel slice of the proposal's window. When
/// both `y0` and `y1` baseline hints are present, explicit trapezoid anchor
/// samples replace the raw endpoint noise. Zero-width or inverted windows
/// produce empty-payload features, never errors.
pub fn simple_integrate(trace: &Trace, proposals: &[BoundaryProposal]) -> Vec<FeatureDraft> {
    let combined = trace.combined();
    proposals.iter()
        .map(|proposal| {
            let mut payload = combined.slice(proposal.t_start, proposal.t_end);
            if let (Some(y0), Some(y1)) = (proposal.hints.y0, proposal.hints.y1) {
                payload = payload.with_baseline_endpoints(proposal.t_start, y0, proposal.t_end, y1);
            }
            let name = format!("{:.2}-{:.2}", proposal.t_start, proposal.t_end);
            let provenance = format!("{},simple_integrate", proposal.hints.provenance.as_deref().unwrap_or(""));
            FeatureDraft::new(name, provenance, payload)
        })
        .collect()
}

/// Resolves overlapping proposals by splitting at the valley between them,
/// then integrates the disjoint remainder.
///
/// # Description
///
/// Proposals are binned into windows and each window is resolved
/// independently. Within one invocation the output features' time ranges
/// never overlap.
pub fn drop_integrate(trace: &Trace, proposals: &[BoundaryProposal]) -> Vec<FeatureDraft> {
    let windows = bin_windows(proposals);
    windows.par_iter()
        .map(|window| {
            let resolved = resolve_window_overlaps(trace, window);
            let mut features = simple_integrate(trace, &resolved);
            for feature in &mut features {
                let upstream = feature.provenance.split(',').next().unwrap_or("").to_string();
                feature.provenance = format!("{},drop_integrate", upstream);
            }
            features
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Turns one window's members into a disjoint set of ranges.
fn resolve_window_overlaps(trace: &Trace, window: &Window) -> Vec<BoundaryProposal> {
    let mut members = window.members.clone();
    members.sort_by_key(|p| OrderedFloat(p.t_start));

    let mut resolved: Vec<BoundaryProposal> = Vec::new();
    for mut proposal in members {
        // fully subsumed by an accepted range: the earlier, wider peak wins
        if resolved.iter().any(|r| proposal.t_end <= r.t_end) {
            continue;
        }
        let conflict = resolved.iter()
            .enumerate()
            .filter(|(_, r)| r.t_end >= proposal.t_start)
            .max_by_key(|(_, r)| OrderedFloat(r.t_start))
            .map(|(index, _)| index);
        match conflict {
            Some(index) => {
                let mut earlier = resolved.remove(index);
                let valley = valley_time(trace, proposal.t_start, earlier.t_end);
                if let (Some(y0), Some(y1)) = (earlier.hints.y0, proposal.hints.y1) {
                    // the two trapezoids must meet continuously at the split
                    let shared = interpolate(earlier.t_start, y0, proposal.t_end, y1, valley);
                    earlier.hints.y1 = Some(shared);
                    proposal.hints.y0 = Some(shared);
                }
                earlier.t_end = valley;
                proposal.t_start = valley;
                resolved.push(earlier);
                resolved.push(proposal);
            }
            None => resolved.push(proposal),
        }
    }
    resolved
}

/// Time of the lowest combined-signal sample over the overlap region.
fn valley_time(trace: &Trace, t0: f64, t1: f64) -> f64 {
    let overlap = trace.combined().slice(t0, t1);
    let total = overlap.total_intensity();
    match total.iter().position_min_by_key(|value| OrderedFloat(**value)) {
        Some(index) => overlap.times[index],
        None => {
            // overlap narrower than the sampling interval leaves no sample to split at
            warn!(t0, t1, "no samples inside overlap, splitting at the midpoint");
            0.5 * (t0 + t1)
        }
    }
}

fn interpolate(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Jointly fits a sum of peak models per window and emits one feature per
/// fitted component.
///
/// # Description
///
/// Initial parameters come from each proposal's `fit` hint when present,
/// otherwise from the initial-condition estimator seeded at the proposal's
/// midpoint. Each output feature's payload is the isolated curve of its own
/// component over the window's time grid. An unregistered model name and any
/// solver failure surface as errors; nothing is retried.
pub fn leastsq_integrate(
    trace: &Trace,
    proposals: &[BoundaryProposal],
    model_name: &str,
    registry: &PeakModelRegistry,
    options: &FitOptions,
) -> Result<Vec<FeatureDraft>, IntegrateError> {
    let model = registry.get(model_name)
        .ok_or_else(|| IntegrateError::UnknownPeakModel(model_name.to_string()))?;

    let windows = bin_windows(proposals);
    let per_window: Vec<Vec<FeatureDraft>> = windows.par_iter()
        .map(|window| {
            let windowed = trace.slice(window.span.0, window.span.1).combined();
            let observed = windowed.total_intensity();
            let initial: Vec<PeakParams> = window.members.iter()
                .map(|p| {
                    p.hints.fit.unwrap_or_else(|| estimate_initial(&windowed, 0.5 * (p.t_start + p.t_end)))
                })
                .collect();
            let fitted = fit_peak_sum(&windowed.times, &observed, model, &initial, options)?;

            Ok(fitted.iter()
                .zip(window.members.iter())
                .map(|(params, proposal)| {
                    let curve = model.evaluate(&windowed.times, params);
                    let payload = Trace::single(ChannelId::Total, windowed.times.clone(), curve);
                    let name = format!("{:.2}", params.x);
                    let provenance = format!("{},leastsq_integrate", proposal.hints.provenance.as_deref().unwrap_or(""));
                    let mut feature = FeatureDraft::new(name, provenance, payload);
                    feature.center = Some(params.x);
                    feature
                })
                .collect())
        })
        .collect::<Result<Vec<_>, IntegrateError>>()?;

    Ok(per_window.into_iter().flatten().collect())
}

/// Collapses features that are the same physical peak seen on different ions.
///
/// # Description
///
/// Features are sorted by retention time and scanned against the previously
/// accepted feature: coincident centers on *different* leading ions merge by
/// intersecting the earlier feature's channel set with the later's;
/// same-ion coincidences are left alone. Features without a retention time
/// sort last and never merge.
pub fn merge_ions(features: Vec<FeatureDraft>) -> Vec<FeatureDraft> {
    let by_time: Vec<FeatureDraft> = features.into_iter()
        .sorted_by_key(|f| OrderedFloat(f.retention_time().unwrap_or(f64::NAN)))
        .collect();

    let mut merged: Vec<FeatureDraft> = Vec::new();
    let mut accepted_time: Option<f64> = None;
    for feature in by_time {
        let time = feature.retention_time();
        let coincident = match (accepted_time, time) {
            (Some(previous), Some(current)) => (current - previous).abs() < ION_COINCIDENCE_WINDOW,
            _ => false,
        };
        let cross_ion = match (merged.last().and_then(|f| f.leading_ion()), feature.leading_ion()) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };
        if coincident && cross_ion {
            if let Some(last) = merged.last_mut() {
                last.intersect_ions(&feature);
            }
        } else {
            accepted_time = time;
            merged.push(feature);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::peak_model::PeakModel;
    use crate::data::feature::PeakHints;

    fn ramp_trace() -> Trace {
        // single minimum at t = 1.4 inside the (1.0, 2.0) overlap
        Trace::single(
            ChannelId::Total,
            vec![0.0, 0.5, 1.0, 1.4, 1.8, 2.2, 2.6, 3.0, 5.0, 5.5, 6.0],
            vec![5.0, 4.0, 3.0, 1.0, 2.5, 4.0, 5.0, 6.0, 2.0, 3.0, 2.0],
        )
    }

    fn tagged(t0: f64, t1: f64, tag: &str) -> BoundaryProposal {
        BoundaryProposal::with_hints(
            t0,
            t1,
            PeakHints { provenance: Some(tag.to_string()), ..PeakHints::default() },
        )
    }

    #[test]
    fn test_bin_windows_scenario() {
        let windows = bin_windows(&[
            BoundaryProposal::new(0.0, 2.0),
            BoundaryProposal::new(1.0, 3.0),
            BoundaryProposal::new(5.0, 6.0),
        ]);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].span, (0.0, 3.0));
        assert_eq!(windows[0].members.len(), 2);
        assert_eq!(windows[1].span, (5.0, 6.0));
        assert_eq!(windows[1].members.len(), 1);
    }

    #[test]
    fn test_bin_windows_partitions_input() {
        let proposals = vec![
            BoundaryProposal::new(0.0, 1.0),
            BoundaryProposal::new(4.0, 5.0),
            BoundaryProposal::new(0.5, 1.5),
            BoundaryProposal::new(9.0, 9.5),
        ];
        let windows = bin_windows(&proposals);
        let total: usize = windows.iter().map(|w| w.members.len()).sum();
        assert_eq!(total, proposals.len());
    }

    #[test]
    fn test_bin_windows_closes_transitive_bridges() {
        // the third proposal bridges the first two clusters
        let windows = bin_windows(&[
            BoundaryProposal::new(0.0, 1.0),
            BoundaryProposal::new(2.0, 3.0),
            BoundaryProposal::new(0.5, 2.5),
        ]);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].span, (0.0, 3.0));
        assert_eq!(windows[0].members.len(), 3);
    }

    #[test]
    fn test_simple_integrate_names_and_provenance() {
        let features = simple_integrate(&ramp_trace(), &[tagged(0.0, 2.0, "detector")]);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name, "0.00-2.00");
        assert_eq!(features[0].provenance, "detector,simple_integrate");
    }

    #[test]
    fn test_simple_integrate_zero_width_is_empty() {
        let features = simple_integrate(&ramp_trace(), &[BoundaryProposal::new(2.05, 2.05)]);
        assert_eq!(features.len(), 1);
        assert!(features[0].payload.is_empty());
    }

    #[test]
    fn test_simple_integrate_synthesizes_trapezoid_closure() {
        let proposal = BoundaryProposal::with_hints(
            0.9,
            2.3,
            PeakHints { y0: Some(0.5), y1: Some(0.7), ..PeakHints::default() },
        );
        let features = simple_integrate(&ramp_trace(), &[proposal]);
        let payload = &features[0].payload;
        assert_eq!(payload.times.first(), Some(&0.9));
        assert_eq!(payload.times.last(), Some(&2.3));
        let data = payload.channel(&ChannelId::Total).unwrap();
        assert_eq!(data.first(), Some(&0.5));
        assert_eq!(data.last(), Some(&0.7));
    }

    #[test]
    fn test_drop_equals_simple_for_disjoint_proposals() {
        let trace = ramp_trace();
        let proposals = vec![tagged(0.0, 1.0, "a"), tagged(2.0, 3.0, "b"), tagged(5.0, 6.0, "c")];
        let simple = simple_integrate(&trace, &proposals);
        let dropped = drop_integrate(&trace, &proposals);

        assert_eq!(simple.len(), dropped.len());
        for (s, d) in simple.iter().zip(dropped.iter()) {
            assert_eq!(s.name, d.name);
            assert_eq!(s.payload, d.payload);
        }
    }

    #[test]
    fn test_drop_splits_at_valley() {
        let features = drop_integrate(
            &ramp_trace(),
            &[BoundaryProposal::new(0.0, 2.0), BoundaryProposal::new(1.0, 3.0)],
        );
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].name, "0.00-1.40");
        assert_eq!(features[1].name, "1.40-3.00");
    }

    #[test]
    fn test_drop_rewrites_provenance_to_upstream_tag() {
        let features = drop_integrate(
            &ramp_trace(),
            &[tagged(0.0, 2.0, "detector"), tagged(1.0, 3.0, "detector")],
        );
        for feature in &features {
            assert_eq!(feature.provenance, "detector,drop_integrate");
        }
    }

    #[test]
    fn test_drop_interpolates_shared_baseline_at_valley() {
        let first = BoundaryProposal::with_hints(
            0.0,
            2.0,
            PeakHints { y0: Some(2.0), y1: Some(3.0), ..PeakHints::default() },
        );
        let second = BoundaryProposal::with_hints(
            1.0,
            3.0,
            PeakHints { y0: Some(3.0), y1: Some(4.0), ..PeakHints::default() },
        );
        let features = drop_integrate(&ramp_trace(), &[first, second]);
        assert_eq!(features.len(), 2);

        // baseline interpolated at the valley over (0.0, 3.0): 2 + 2 * 1.4 / 3
        let shared = 2.0 + 2.0 * 1.4 / 3.0;
        let first_data = features[0].payload.channel(&ChannelId::Total).unwrap();
        let second_data = features[1].payload.channel(&ChannelId::Total).unwrap();
        assert!((first_data.last().unwrap() - shared).abs() < 1e-12);
        assert!((second_data.first().unwrap() - shared).abs() < 1e-12);
    }

    #[test]
    fn test_drop_discards_subsumed_proposals() {
        let features = drop_integrate(
            &ramp_trace(),
            &[BoundaryProposal::new(0.0, 3.0), BoundaryProposal::new(1.0, 2.0)],
        );
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name, "0.00-3.00");
    }

    #[test]
    fn test_resolved_ranges_never_overlap() {
        let trace = ramp_trace();
        let proposals = vec![
            BoundaryProposal::new(0.0, 2.0),
            BoundaryProposal::new(1.0, 2.6),
            BoundaryProposal::new(2.2, 3.0),
        ];
        for window in bin_windows(&proposals) {
            let resolved = resolve_window_overlaps(&trace, &window);
            for (i, a) in resolved.iter().enumerate() {
                for b in resolved.iter().skip(i + 1) {
                    assert!(a.t_end <= b.t_start || b.t_end <= a.t_start);
                }
            }
        }
    }

    #[test]
    fn test_leastsq_unknown_model_is_fatal() {
        let result = leastsq_integrate(
            &ramp_trace(),
            &[BoundaryProposal::new(0.0, 2.0)],
            "gauss",
            &PeakModelRegistry::default(),
            &FitOptions::default(),
        );
        assert!(matches!(result, Err(IntegrateError::UnknownPeakModel(_))));
    }

    #[test]
    fn test_leastsq_recovers_hinted_gaussian() {
        let times: Vec<f64> = (0..101).map(|i| i as f64 * 0.1).collect();
        let truth = PeakParams::new(5.0, 0.8, 10.0);
        let data = PeakModel::Gaussian.evaluate(&times, &truth);
        let trace = Trace::single(ChannelId::Total, times, data);

        let proposal = BoundaryProposal::with_hints(
            3.0,
            7.0,
            PeakHints {
                fit: Some(PeakParams::new(4.9, 0.9, 9.0)),
                provenance: Some("detector".to_string()),
                ..PeakHints::default()
            },
        );
        let features = leastsq_integrate(
            &trace,
            &[proposal],
            "gaussian",
            &PeakModelRegistry::default(),
            &FitOptions::default(),
        )
        .unwrap();

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name, "5.00");
        assert_eq!(features[0].provenance, "detector,leastsq_integrate");
        let center = features[0].center.unwrap();
        assert!((center - truth.x).abs() < 0.01 * truth.x);
    }

    #[test]
    fn test_leastsq_estimates_initial_conditions_per_window() {
        let times: Vec<f64> = (0..101).map(|i| i as f64 * 0.1).collect();
        let truth = [PeakParams::new(3.5, 0.6, 8.0), PeakParams::new(7.0, 0.6, 5.0)];
        let data: Vec<f64> = times.iter()
            .map(|&t| truth.iter().map(|p| PeakModel::Gaussian.evaluate_at(t, p)).sum())
            .collect();
        let trace = Trace::single(ChannelId::Total, times, data);

        let proposals = vec![BoundaryProposal::new(2.0, 5.5), BoundaryProposal::new(5.0, 8.5)];
        let features = leastsq_integrate(
            &trace,
            &proposals,
            "gaussian",
            &PeakModelRegistry::default(),
            &FitOptions::default(),
        )
        .unwrap();

        assert_eq!(features.len(), 2);
        let centers: Vec<f64> = features.iter().map(|f| f.center.unwrap()).collect();
        assert!((centers[0] - 3.5).abs() < 0.05);
        assert!((centers[1] - 7.0).abs() < 0.05);
    }

    fn ion_feature(center: f64, channels: Vec<(ChannelId, Vec<f64>)>) -> FeatureDraft {
        let times = vec![center - 0.1, center, center + 0.1];
        let payload = Trace::new(times, channels.into_iter().collect());
        let mut feature = FeatureDraft::new(format!("{:.2}", center), ",simple_integrate".to_string(), payload);
        feature.center = Some(center);
        feature
    }

    #[test]
    fn test_merge_ions_collapses_cross_ion_coincidence() {
        let first = ion_feature(
            5.0,
            vec![
                (ChannelId::ion(44.0), vec![1.0, 2.0, 1.0]),
                (ChannelId::ion(45.0), vec![0.5, 1.0, 0.5]),
            ],
        );
        let second = ion_feature(
            5.005,
            vec![
                (ChannelId::ion(45.0), vec![0.4, 0.9, 0.4]),
                (ChannelId::ion(46.0), vec![0.1, 0.2, 0.1]),
            ],
        );
        let merged = merge_ions(vec![first, second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].payload.channels.keys().copied().collect::<Vec<_>>(),
            vec![ChannelId::ion(45.0)]
        );
        assert!(merged[0].ions.is_none());
    }

    #[test]
    fn test_merge_ions_keeps_separated_features() {
        let first = ion_feature(5.0, vec![(ChannelId::ion(44.0), vec![1.0, 2.0, 1.0])]);
        let second = ion_feature(5.02, vec![(ChannelId::ion(45.0), vec![0.5, 1.0, 0.5])]);
        let merged = merge_ions(vec![second, first]);
        assert_eq!(merged.len(), 2);
        // output comes back time-ordered
        assert_eq!(merged[0].center, Some(5.0));
        assert_eq!(merged[1].center, Some(5.02));
    }

    #[test]
    fn test_merge_ions_never_merges_same_leading_ion() {
        let first = ion_feature(5.0, vec![(ChannelId::ion(44.0), vec![1.0, 2.0, 1.0])]);
        let second = ion_feature(5.005, vec![(ChannelId::ion(44.0), vec![0.5, 1.0, 0.5])]);
        let merged = merge_ions(vec![first, second]);
        assert_eq!(merged.len(), 2);
    }
}
