pub mod branch;
pub mod context;
pub mod dna_error;
pub mod filter;
pub mod fundi;
pub mod indels;
pub mod length_ratio;
pub mod params;
pub mod run;
pub mod sampling;
pub mod walker;
