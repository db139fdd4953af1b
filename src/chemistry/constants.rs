// Purpose: To store physical constants used for isotope-ratio corrections

pub const FRACTIONATION_EXPONENT: f64 = 0.5164; // mass-dependent 17O/18O fractionation slope
pub const O17_CORRECTION: f64 = 0.0092; // 17O abundance correction factor
pub const R13_VPDB: f64 = 0.011237; // 13C/12C ratio of the VPDB standard
pub const R18_VSMOW: f64 = 0.002005; // 18O/16O ratio of the VSMOW standard

// CO2 isotopologue ion beams used for delta 13C work
pub const MZ_CO2_44: f64 = 44.0; // 12C 16O 16O
pub const MZ_CO2_45: f64 = 45.0; // 13C 16O 16O and 12C 17O 16O
pub const MZ_CO2_46: f64 = 46.0; // 12C 18O 16O
