//! BMI-stratified mortality observer with a washout reporting window.
//!
//! On every metrics pull the observer takes the current population,
//! treats the living as exiting now, keeps everyone whose exit falls before
//! the end of the washout period, splits them by BMI category and reports
//! person-time, deaths and YLLs per category.

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, info};
use polars::prelude::*;

use crate::bmi::{with_category_column, BmiCategory};
use crate::builder::{Builder, Clock, Component, Event, MetricsMap, PopulationView, ValueSource};
use crate::config::{to_micros, BmiMetricsConfig};
use crate::error::WashoutError;
use crate::mortality::{
    age_groups_from_frame, population_totals, LifeExpectancy, MortalityMetrics, Stratification,
};
use crate::schema::{events, exposure, keys, population};

const BMI: &str = "bmi";

// ── Report ──────────────────────────────────────────────────────────────────

/// The engine-independent part of the observer: everything needed to turn a
/// population frame and a BMI frame into metrics.
#[derive(Debug, Clone)]
pub struct WashoutReport {
    program_start: NaiveDateTime,
    washout_period_end: NaiveDateTime,
    mortality: MortalityMetrics,
}

impl WashoutReport {
    /// Fails when the program starts before the simulation does.
    pub fn new(
        config: &BmiMetricsConfig,
        simulation_start: NaiveDateTime,
        mortality: MortalityMetrics,
    ) -> Result<Self, WashoutError> {
        let program_start = config.washout.program_start_time()?;
        if program_start < simulation_start {
            return Err(WashoutError::Configuration(format!(
                "The washout program must begin after the start of the simulation. \
                 Your simulation begins: {simulation_start} while the washout program \
                 begins {program_start}."
            )));
        }
        Ok(Self {
            program_start,
            washout_period_end: config.washout.period_end()?,
            mortality,
        })
    }

    pub fn program_start(&self) -> NaiveDateTime {
        self.program_start
    }

    pub fn washout_period_end(&self) -> NaiveDateTime {
        self.washout_period_end
    }

    /// Metrics for one pull. Simulants exiting at or after the end of the
    /// washout period contribute to none of them, totals included.
    ///
    /// `population` holds the mortality columns for the requested simulants,
    /// `bmi` holds `simulant_id` and `value` for the same simulants. Neither
    /// is modified.
    pub fn compute(
        &self,
        population: &DataFrame,
        bmi: &DataFrame,
        clock: NaiveDateTime,
    ) -> Result<MetricsMap, WashoutError> {
        let eligible = self.eligible(population, clock)?;
        let totals = population_totals(&eligible)?;
        let categorized = self.categorize(eligible, bmi)?;
        debug!(
            "{} of {} simulants exit before {}",
            categorized.height(),
            population.height(),
            self.washout_period_end
        );

        let mut out = MetricsMap::new();
        for category in BmiCategory::ALL {
            let members = categorized
                .clone()
                .lazy()
                .filter(col(exposure::BMI_CATEGORY).eq(lit(category.name())))
                .collect()?;
            if members.height() == 0 {
                continue;
            }
            for (key, value) in self.mortality.compute(&members)? {
                out.insert(format!("{key}_among_{category}"), value);
            }
        }

        out.extend(totals);
        Ok(out)
    }

    /// Rows whose exit time, with the living exiting at `clock`, is strictly
    /// before the end of the washout period.
    fn eligible(&self, population: &DataFrame, clock: NaiveDateTime) -> Result<DataFrame, WashoutError> {
        if population.column(population::EXIT_TIME).is_err() {
            return Err(WashoutError::MissingColumn(population::EXIT_TIME.to_string()));
        }
        let datetime = DataType::Datetime(TimeUnit::Microseconds, None);
        let exit_us = col(population::EXIT_TIME)
            .cast(datetime.clone())
            .cast(DataType::Int64)
            .fill_null(lit(to_micros(clock)));

        let df = population
            .clone()
            .lazy()
            .with_column(exit_us.alias(population::EXIT_TIME))
            .filter(col(population::EXIT_TIME).lt(lit(to_micros(self.washout_period_end))))
            .with_column(col(population::EXIT_TIME).cast(datetime))
            .collect()?;
        Ok(df)
    }

    /// Attach the BMI category to every row, dropping the unclassified.
    fn categorize(&self, eligible: DataFrame, bmi: &DataFrame) -> Result<DataFrame, WashoutError> {
        for required in [population::SIMULANT_ID, exposure::VALUE] {
            if bmi.column(required).is_err() {
                return Err(WashoutError::MissingColumn(format!("{required} (BMI exposure)")));
            }
        }
        let bmi = bmi.clone().lazy().select([
            col(population::SIMULANT_ID).cast(DataType::UInt32),
            col(exposure::VALUE).cast(DataType::Float64).alias(BMI),
        ]);
        let joined = eligible
            .lazy()
            .with_column(col(population::SIMULANT_ID).cast(DataType::UInt32))
            .join(
                bmi,
                [col(population::SIMULANT_ID)],
                [col(population::SIMULANT_ID)],
                JoinArgs::new(JoinType::Left),
            )
            .collect()?;

        let missing = joined.column(BMI)?.null_count();
        if missing > 0 {
            return Err(WashoutError::InvalidData(format!(
                "No BMI exposure for {missing} simulants"
            )));
        }

        let df = with_category_column(joined, BMI)?
            .lazy()
            .filter(col(exposure::BMI_CATEGORY).is_not_null())
            .collect()?;
        Ok(df)
    }
}

// ── Component ───────────────────────────────────────────────────────────────

struct Handles {
    population_view: Arc<dyn PopulationView>,
    step_size: TimeDelta,
    bmi_exposure: Arc<dyn ValueSource>,
    clock: Arc<dyn Clock>,
    report: WashoutReport,
}

/// Bins mortality observation by BMI and washes out deaths in a period.
pub struct WashoutObserver {
    handles: Option<Handles>,
    last_collection: Option<NaiveDateTime>,
}

impl Default for WashoutObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl WashoutObserver {
    pub fn new() -> Self {
        Self {
            handles: None,
            last_collection: None,
        }
    }

    pub fn report(&self) -> Option<&WashoutReport> {
        self.handles.as_ref().map(|h| &h.report)
    }

    /// Time of the latest `collect_metrics` event seen.
    pub fn last_collection(&self) -> Option<NaiveDateTime> {
        self.last_collection
    }

    /// Metrics for `index`, merged over `running`. Keys already present in
    /// `running` are overwritten.
    pub fn metrics(&self, index: &[u32], mut running: MetricsMap) -> Result<MetricsMap, WashoutError> {
        let handles = self.handles.as_ref().ok_or_else(|| {
            WashoutError::General("WashoutObserver used before setup".to_string())
        })?;
        let pop = handles.population_view.get(index)?;
        let bmi = handles.bmi_exposure.get(index)?;
        let computed = handles.report.compute(&pop, &bmi, handles.clock.now())?;
        running.extend(computed);
        Ok(running)
    }
}

impl Component for WashoutObserver {
    fn name(&self) -> String {
        "obesity_washout_observer".to_string()
    }

    fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError> {
        let config = builder.configuration().metrics.bmi.clone();

        let life_expectancy = LifeExpectancy::from_frame(&builder.load(keys::LIFE_EXPECTANCY)?)?;
        let age_groups = if config.by_age {
            Some(age_groups_from_frame(&builder.load(keys::AGE_BINS)?)?)
        } else {
            None
        };
        let mortality = MortalityMetrics::new(
            &builder.causes_of_death(),
            life_expectancy,
            Stratification::from_config(&config, age_groups),
        );
        let report = WashoutReport::new(&config, builder.start_time(), mortality)?;

        let mut columns: Vec<&str> = population::MORTALITY_COLUMNS.to_vec();
        if config.by_sex {
            columns.push(population::SEX);
        }
        let population_view = builder.population_view(&columns)?;
        let bmi_exposure = builder.get_value(keys::BMI_EXPOSURE)?;

        builder.register_listener(events::COLLECT_METRICS);
        builder.register_value_modifier(keys::METRICS);

        info!(
            "Washout program starts {}, reporting window closes {}",
            report.program_start(),
            report.washout_period_end()
        );
        self.handles = Some(Handles {
            population_view,
            bmi_exposure,
            step_size: builder.step_size(),
            clock: builder.clock(),
            report,
        });
        Ok(())
    }

    fn on_event(&mut self, event: &Event) -> Result<(), WashoutError> {
        if event.name != events::COLLECT_METRICS {
            return Ok(());
        }
        let previous = self.last_collection.replace(event.time);
        let Some(handles) = self.handles.as_ref() else {
            return Ok(());
        };
        let now = previous.unwrap_or(event.time - handles.step_size);
        let report = &handles.report;
        if now < report.program_start() && report.program_start() <= event.time {
            info!("Washout program started at {}", report.program_start());
        }
        if now < report.washout_period_end() && report.washout_period_end() <= event.time {
            info!(
                "Washout period ended at {}; later exits are not reported",
                report.washout_period_end()
            );
        }
        Ok(())
    }

    fn modify_metrics(&self, index: &[u32], metrics: MetricsMap) -> Result<MetricsMap, WashoutError> {
        self.metrics(index, metrics)
    }
}

impl fmt::Display for WashoutObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WashoutObserver()")
    }
}
