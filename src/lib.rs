// chemistry module
pub mod chemistry {
    pub mod constants;
}

// algorithm module
pub mod algorithm {
    pub mod peak_model;
    pub mod fitting;
    pub mod integrate;
    pub mod isotope;
}

// data module
pub mod data {
    pub mod trace;
    pub mod feature;
}
