use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Serialize, Deserialize};

use crate::algorithm::peak_model::PeakParams;
use crate::data::trace::{ChannelId, Trace};

/// Recognized integration hints attached to a boundary proposal.
///
/// # Description
///
/// Upstream proposers (detectors, manual selection) communicate through
/// exactly these fields; unrecognized hints are not representable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct PeakHints {
    /// Manually anchored baseline value at the window start.
    pub y0: Option<f64>,
    /// Manually anchored baseline value at the window end.
    pub y1: Option<f64>,
    /// Pre-seeded model parameters for least-squares integration, bypassing
    /// the initial-condition estimator.
    pub fit: Option<PeakParams>,
    /// Tag of the upstream proposer, carried into feature provenance.
    pub provenance: Option<String>,
}

/// A candidate peak boundary pair supplied by the caller.
///
/// `t_start <= t_end` is not enforced; zero-width or inverted windows
/// degrade to empty-payload features instead of failing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct BoundaryProposal {
    pub t_start: f64,
    pub t_end: f64,
    pub hints: PeakHints,
}

impl BoundaryProposal {
    pub fn new(t_start: f64, t_end: f64) -> Self {
        BoundaryProposal { t_start, t_end, hints: PeakHints::default() }
    }

    pub fn with_hints(t_start: f64, t_end: f64, hints: PeakHints) -> Self {
        BoundaryProposal { t_start, t_end, hints }
    }
}

/// Distinguishes reference-standard features from ordinary samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum FeatureKind {
    Sample,
    Standard,
}

impl Default for FeatureKind {
    fn default() -> Self {
        FeatureKind::Sample
    }
}

/// A quantified peak produced by an integrator.
///
/// # Description
///
/// Drafts are lightweight values; identity, parentage and persistence are
/// attached later by the caller when a draft is promoted to an owned entity.
/// The payload trace is exclusively owned and never aliases the input trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct FeatureDraft {
    /// Display name, a formatted retention-time range or fitted center.
    pub name: String,
    /// Comma-joined chain of integration strategies applied.
    pub provenance: String,
    pub kind: FeatureKind,
    /// Fitted center time, when the feature came out of a model fit.
    pub center: Option<f64>,
    /// Cached enumeration of the payload's ion channels; dropped when a
    /// merge makes it stale.
    pub ions: Option<Vec<ChannelId>>,
    pub payload: Trace,
}

impl FeatureDraft {
    pub fn new(name: String, provenance: String, payload: Trace) -> Self {
        let ions = Some(payload.channels.keys().copied().collect());
        FeatureDraft { name, provenance, kind: FeatureKind::default(), center: None, ions, payload }
    }

    /// The feature's retention time: the fitted center when one exists,
    /// otherwise the apex of the payload.
    pub fn retention_time(&self) -> Option<f64> {
        self.center.or_else(|| self.payload.apex_time())
    }

    /// The leading ion channel of the payload.
    pub fn leading_ion(&self) -> Option<&ChannelId> {
        self.payload.leading_channel()
    }

    /// Raw intensity of the ion channel whose label lies within one mass
    /// unit of `mz`, integrated over the payload.
    ///
    /// Returns `None` when no such channel exists.
    pub fn ion_intensity(&self, mz: f64) -> Option<f64> {
        let id = self.payload.channels.keys()
            .find(|channel| channel.mz().map(|label| (label - mz).abs() < 1.0).unwrap_or(false))?;
        self.payload.area(id)
    }

    /// Restricts the payload to the channels shared with `other` and drops
    /// the now-stale ion enumeration.
    pub fn intersect_ions(&mut self, other: &FeatureDraft) {
        self.payload.channels.retain(|id, _| other.payload.channels.contains_key(id));
        self.ions = None;
    }
}

impl Display for FeatureDraft {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureDraft({}, provenance: {})", self.name, self.provenance)
    }
}
