//! Fitting of bovine tuberculosis spread across a cattle-farm cluster coupled
//! to a badger reservoir: a tau-leap outbreak simulator scored against
//! observed SNP pairwise distances, driven by an adaptive Metropolis chain.

pub mod animal;
pub mod config;
pub mod fit;
pub mod herd;
pub mod inputs;
pub mod scenario;
pub mod stats;
pub mod tree;
