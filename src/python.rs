use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDateTime};
use pyo3::prelude::*;
use pyo3_polars::PyDataFrame;

use crate::bmi::BmiCategory;
use crate::config::{BmiMetricsConfig, CalendarDate, WashoutConfig};
use crate::mortality::{age_groups_from_frame, LifeExpectancy, MortalityMetrics, Stratification};
use crate::observer::WashoutReport;

/// Washout metrics for one population snapshot.
///
/// `population` carries the mortality columns (plus `sex` when `by_sex`),
/// `bmi` carries `simulant_id` and `value`. Passing `age_bins` turns on age
/// stratification.
#[pyfunction]
#[pyo3(signature = (
    population,
    bmi,
    life_expectancy,
    clock,
    simulation_start,
    program_start,
    duration=5,
    causes=Vec::new(),
    by_year=false,
    by_sex=false,
    age_bins=None,
))]
#[allow(clippy::too_many_arguments)]
fn washout_metrics(
    population: PyDataFrame,
    bmi: PyDataFrame,
    life_expectancy: PyDataFrame,
    clock: NaiveDateTime,
    simulation_start: NaiveDateTime,
    program_start: NaiveDateTime,
    duration: u32,
    causes: Vec<String>,
    by_year: bool,
    by_sex: bool,
    age_bins: Option<PyDataFrame>,
) -> PyResult<BTreeMap<String, f64>> {
    let date = program_start.date();
    let config = BmiMetricsConfig {
        by_age: age_bins.is_some(),
        by_year,
        by_sex,
        washout: WashoutConfig {
            program_start: CalendarDate::new(date.year(), date.month(), date.day()),
            duration,
        },
    };
    let age_groups = match age_bins {
        Some(df) => Some(age_groups_from_frame(&df.0)?),
        None => None,
    };
    let mortality = MortalityMetrics::new(
        &causes,
        LifeExpectancy::from_frame(&life_expectancy.0)?,
        Stratification::from_config(&config, age_groups),
    );
    let report = WashoutReport::new(&config, simulation_start, mortality)?;
    Ok(report.compute(&population.0, &bmi.0, clock)?)
}

/// Category name for a BMI value, `None` outside `[15, 60)`.
#[pyfunction]
fn bmi_category(bmi: f64) -> Option<&'static str> {
    BmiCategory::categorize(bmi).map(|c| c.name())
}

pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(washout_metrics, m)?)?;
    m.add_function(wrap_pyfunction!(bmi_category, m)?)?;

    let categories: Vec<&str> = BmiCategory::ALL.iter().map(|c| c.name()).collect();
    m.add("BMI_CATEGORIES", categories)?;
    m.add("CUT_POINTS", crate::bmi::CUT_POINTS.to_vec())?;
    Ok(())
}
