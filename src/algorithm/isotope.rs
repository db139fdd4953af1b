use crate::chemistry::constants::{
    FRACTIONATION_EXPONENT, MZ_CO2_44, MZ_CO2_45, MZ_CO2_46, O17_CORRECTION, R13_VPDB, R18_VSMOW,
};
use crate::data::feature::{FeatureDraft, FeatureKind};

/// Corrected delta 13C of a sample feature, in permil against VPDB.
///
/// # Description
///
/// `siblings` are the other features of the same parent run; the first one
/// flagged as a standard supplies the reference ratios. `nominal_delta` is
/// the parent run's recorded delta value for its standard gas. A feature
/// that is itself a standard reports the nominal value unchanged.
///
/// The 45/44 and 46/44 voltage ratios of the standard yield closed-form
/// correction factors; the sample's corrected ion-current ratios then feed
/// four Newton iterations on the oxygen mass-balance polynomial, seeded at
/// VSMOW, before the carbon ratio is backed out. The fixed iteration count
/// bounds cost and is sufficient near natural abundances.
///
/// Returns `None` when no standard exists or a required ion beam is missing
/// from a payload; both are data gaps, not errors.
pub fn delta13c(sample: &FeatureDraft, siblings: &[FeatureDraft], nominal_delta: f64) -> Option<f64> {
    if sample.kind == FeatureKind::Standard {
        return Some(nominal_delta);
    }

    // TODO: build a correction-factor curve over time from all standards
    let standard = siblings.iter().find(|s| s.kind == FeatureKind::Standard)?;
    let (s44, s45, s46) = three_mass_intensities(standard)?;
    let (a44, a45, a46) = three_mass_intensities(sample)?;

    let (a, k) = (FRACTIONATION_EXPONENT, O17_CORRECTION);

    // abundance ratios of the isotope standard
    let r45std = s45 / s44;
    let r46std = s46 / s44;
    // known ratios for the standard; its oxygen is taken as exactly VSMOW
    let r13std = (nominal_delta / 1000.0 + 1.0) * R13_VPDB;
    let r18std = R18_VSMOW;

    // voltage-to-ion correction factors
    let c45 = (r13std + 2.0 * k * r18std.powf(a)) / r45std;
    let c46 = ((k * r18std.powf(a)).powi(2) + 2.0 * r13std * k * r18std.powf(a) + 2.0 * r18std) / r46std;

    // correct the sample's voltage ratios to ion-current ratios
    let r45 = (a45 / a44) * c45;
    let r46 = (a46 / a44) * c46;

    // newton's method on the oxygen mass balance, seeded at VSMOW
    let mut r18 = R18_VSMOW;
    for _ in 0..4 {
        let value = -3.0 * (k * r18.powf(a)).powi(2) + 2.0 * k * r45 * r18.powf(a) + 2.0 * r18 - r46;
        let slope = -6.0 * a * k.powi(2) * r18.powf(2.0 * a - 1.0)
            + 2.0 * a * k * r45 * r18.powf(a - 1.0)
            + 2.0;
        r18 -= value / slope;
    }

    let r13 = r45 - 2.0 * k * r18.powf(a);
    Some(1000.0 * (r13 / R13_VPDB - 1.0))
}

fn three_mass_intensities(feature: &FeatureDraft) -> Option<(f64, f64, f64)> {
    Some((
        feature.ion_intensity(MZ_CO2_44)?,
        feature.ion_intensity(MZ_CO2_45)?,
        feature.ion_intensity(MZ_CO2_46)?,
    ))
}
