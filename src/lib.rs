//! Obesity washout study components.
//!
//! A BMI-stratified mortality observer with a washout reporting window, the
//! CKD and type 2 diabetes disease models, and the artifact build step that
//! patches in asthma remission data.

pub mod artifact;
pub mod bmi;
pub mod builder;
pub mod cause_models;
pub mod cli;
pub mod config;
pub mod context;
pub mod disease;
pub mod error;
pub mod measures;
pub mod mortality;
pub mod observer;
pub mod schema;

#[cfg(feature = "python")]
mod python;

pub use bmi::BmiCategory;
pub use builder::{Builder, Component, MetricsMap};
pub use cause_models::{CkdSi, DiabetesSis};
pub use config::{ModelSpecification, SimulationConfig};
pub use context::SimulationContext;
pub use error::WashoutError;
pub use observer::{WashoutObserver, WashoutReport};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn obesity_washout(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)
}
