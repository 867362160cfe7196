//! Disease models used by the washout study.

use std::fmt;

use log::debug;
use polars::prelude::DataFrame;

use crate::builder::{Builder, Component};
use crate::disease::{
    load_aggregated_measure, load_measure, measure, DiseaseModel, DiseaseState,
};
use crate::error::WashoutError;
use crate::schema::keys;

// ── Chronic kidney disease ──────────────────────────────────────────────────

pub const CKD_CAUSE: &str = "chronic_kidney_disease";

pub const CKD_SUBCAUSES: [&str; 5] = [
    "chronic_kidney_disease_due_to_hypertension",
    "chronic_kidney_disease_due_to_glomerulonephritis",
    "chronic_kidney_disease_due_to_other_and_unspecified_causes",
    "chronic_kidney_disease_due_to_diabetes_mellitus_type_1",
    "chronic_kidney_disease_due_to_diabetes_mellitus_type_2",
];

/// Chronic kidney disease as a one-way susceptible → infected model, with
/// every measure aggregated over the CKD subcauses.
#[derive(Debug, Clone)]
pub struct CkdSi {
    cause: String,
    subcauses: Vec<String>,
}

impl Default for CkdSi {
    fn default() -> Self {
        Self {
            cause: CKD_CAUSE.to_string(),
            subcauses: CKD_SUBCAUSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CkdSi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subcauses(&self) -> &[String] {
        &self.subcauses
    }

    fn load(&self, builder: &dyn Builder, measure_name: &str) -> Result<DataFrame, WashoutError> {
        let subcauses: Vec<&str> = self.subcauses.iter().map(|s| s.as_str()).collect();
        load_aggregated_measure(builder, &subcauses, measure_name)
    }

    /// Build the model graph from data.
    pub fn model(&self, builder: &dyn Builder) -> Result<DiseaseModel, WashoutError> {
        let healthy = DiseaseState::susceptible(&self.cause);
        let infected = DiseaseState::excess_mortality(&self.cause)
            .with_data(measure::PREVALENCE, self.load(builder, measure::PREVALENCE)?)
            .with_data(
                measure::EXCESS_MORTALITY,
                self.load(builder, measure::EXCESS_MORTALITY)?,
            )
            .with_data(
                measure::DISABILITY_WEIGHT,
                self.load(builder, measure::DISABILITY_WEIGHT)?,
            );
        let (healthy_id, infected_id) = (healthy.state_id.clone(), infected.state_id.clone());

        let mut model = DiseaseModel::new(&self.cause);
        model.add_state(healthy)?;
        model.add_state(infected)?;

        model.allow_self_transitions(&healthy_id)?;
        model.add_rate_transition(
            &healthy_id,
            &infected_id,
            measure::INCIDENCE,
            self.load(builder, measure::INCIDENCE)?,
        )?;
        model.allow_self_transitions(&infected_id)?;

        model.set_cause_specific_mortality(self.load(builder, measure::CAUSE_SPECIFIC_MORTALITY)?);
        Ok(model)
    }
}

impl Component for CkdSi {
    fn name(&self) -> String {
        self.cause.clone()
    }

    fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError> {
        let model = self.model(builder)?;
        debug!("{self}: {model:?}");
        builder.add_disease_model(model);
        Ok(())
    }
}

impl fmt::Display for CkdSi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CKD_SI")
    }
}

// ── Type 2 diabetes ─────────────────────────────────────────────────────────

pub const DIABETES_CAUSE: &str = "diabetes_mellitus_type_2";
/// Remission is only estimated for diabetes as a whole.
pub const DIABETES_REMISSION_CAUSE: &str = "diabetes_mellitus";

/// Type 2 diabetes with remission back to susceptible.
#[derive(Debug, Clone)]
pub struct DiabetesSis {
    cause: String,
}

impl Default for DiabetesSis {
    fn default() -> Self {
        Self {
            cause: DIABETES_CAUSE.to_string(),
        }
    }
}

impl DiabetesSis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self, builder: &dyn Builder) -> Result<DiseaseModel, WashoutError> {
        let cause = self.cause.as_str();
        let healthy = DiseaseState::susceptible(cause);
        let infected = DiseaseState::excess_mortality(cause)
            .with_data(measure::PREVALENCE, load_measure(builder, cause, measure::PREVALENCE)?)
            .with_data(
                measure::EXCESS_MORTALITY,
                load_measure(builder, cause, measure::EXCESS_MORTALITY)?,
            )
            .with_data(
                measure::DISABILITY_WEIGHT,
                load_measure(builder, cause, measure::DISABILITY_WEIGHT)?,
            );
        let (healthy_id, infected_id) = (healthy.state_id.clone(), infected.state_id.clone());

        let mut model = DiseaseModel::new(cause);
        model.add_state(healthy)?;
        model.add_state(infected)?;

        model.allow_self_transitions(&healthy_id)?;
        model.add_rate_transition(
            &healthy_id,
            &infected_id,
            measure::INCIDENCE,
            load_measure(builder, cause, measure::INCIDENCE)?,
        )?;
        model.allow_self_transitions(&infected_id)?;
        model.add_rate_transition(
            &infected_id,
            &healthy_id,
            measure::REMISSION,
            builder.load(&keys::cause(DIABETES_REMISSION_CAUSE, measure::REMISSION))?,
        )?;

        model.set_cause_specific_mortality(load_measure(
            builder,
            cause,
            measure::CAUSE_SPECIFIC_MORTALITY,
        )?);
        Ok(model)
    }
}

impl Component for DiabetesSis {
    fn name(&self) -> String {
        format!("SIS.{}", self.cause)
    }

    fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError> {
        let model = self.model(builder)?;
        debug!("{self}: {model:?}");
        builder.add_disease_model(model);
        Ok(())
    }
}

impl fmt::Display for DiabetesSis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiabetesSIS")
    }
}
