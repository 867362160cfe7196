//! The seam between study components and the simulation engine.
//!
//! Components never talk to a concrete engine. During setup they receive a
//! `Builder` scoped to themselves, which hands out data, values, population
//! views and the clock, and records which notifications the component wants.
//! Registrations made through the builder always bind to the component being
//! set up, so no callbacks cross the seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use polars::prelude::DataFrame;

use crate::config::SimulationConfig;
use crate::disease::DiseaseModel;
use crate::error::WashoutError;

/// Metric name → value. Ordered so repeated pulls compare and print stably.
pub type MetricsMap = BTreeMap<String, f64>;

/// A notification fired by the engine.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub index: Vec<u32>,
    /// Time the event refers to (the end of the current step).
    pub time: NaiveDateTime,
    pub step_size: TimeDelta,
}

/// Read-only access to a subset of population columns.
pub trait PopulationView: Send + Sync {
    /// Rows for `index`, with `simulant_id` plus the view's columns.
    fn get(&self, index: &[u32]) -> Result<DataFrame, WashoutError>;
}

/// A per-simulant value computed by someone else (an exposure, a rate).
pub trait ValueSource: Send + Sync {
    /// Frame of `simulant_id` and `value` for `index`.
    fn get(&self, index: &[u32]) -> Result<DataFrame, WashoutError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Capabilities offered to a component during setup.
pub trait Builder {
    fn configuration(&self) -> &SimulationConfig;

    fn start_time(&self) -> NaiveDateTime;

    fn step_size(&self) -> TimeDelta;

    fn clock(&self) -> Arc<dyn Clock>;

    // ── Data ────────────────────────────────────────────────────────────────

    /// Load a named data series, e.g. `cause.asthma.remission`.
    fn load(&self, key: &str) -> Result<DataFrame, WashoutError>;

    // ── Values ──────────────────────────────────────────────────────────────

    fn get_value(&self, name: &str) -> Result<Arc<dyn ValueSource>, WashoutError>;

    /// Ask to be called through `Component::modify_metrics` whenever the
    /// engine assembles `value_name`.
    fn register_value_modifier(&mut self, value_name: &str);

    // ── Population ──────────────────────────────────────────────────────────

    fn population_view(&self, columns: &[&str]) -> Result<Arc<dyn PopulationView>, WashoutError>;

    // ── Events ──────────────────────────────────────────────────────────────

    /// Ask to be called through `Component::on_event` for `event_name`.
    fn register_listener(&mut self, event_name: &str);

    // ── Components ──────────────────────────────────────────────────────────

    fn add_disease_model(&mut self, model: DiseaseModel);

    /// Causes of death contributed by the disease models registered so far.
    fn causes_of_death(&self) -> Vec<String>;
}

/// A study component: something the engine sets up and later notifies.
pub trait Component {
    /// Stable identifier used for registration and lookup.
    fn name(&self) -> String;

    fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError>;

    fn on_event(&mut self, _event: &Event) -> Result<(), WashoutError> {
        Ok(())
    }

    /// Augment the metrics assembled so far.
    fn modify_metrics(&self, _index: &[u32], metrics: MetricsMap) -> Result<MetricsMap, WashoutError> {
        Ok(metrics)
    }
}
