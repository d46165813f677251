//! Throwaway certificate authority for demonstrating anchor installation.
//!
//! The CA certificate becomes a candidate trust anchor; host certificates it
//! issues are only trusted once that anchor is installed.

mod generator;

pub use generator::{CaError, CaResult, DemoCa};
