//! Model specification and configuration schema.
//!
//! The configuration tree is deserialized once from the YAML model
//! specification, defaults filled in by serde, validated, and never mutated
//! afterwards. Components receive it read-only through the builder.

use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::WashoutError;

/// Average year length used for every year/day conversion in the study.
pub const DAYS_PER_YEAR: f64 = 365.25;
/// 365.25 days, exactly.
pub const SECONDS_PER_YEAR: i64 = 31_557_600;
pub const MICROS_PER_YEAR: f64 = SECONDS_PER_YEAR as f64 * 1_000_000.0;

/// Whole years as a duration of 365.25-day years.
pub fn years(n: u32) -> TimeDelta {
    TimeDelta::seconds(i64::from(n) * SECONDS_PER_YEAR)
}

/// Fractional days as a duration, truncated to the microsecond.
pub fn days(n: f64) -> TimeDelta {
    TimeDelta::microseconds((n * 86_400_000_000.0) as i64)
}

/// Microseconds since the Unix epoch, the physical unit of every datetime
/// column in a population frame.
pub fn to_micros(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp_micros()
}

// ── Schema ──────────────────────────────────────────────────────────────────

/// A `{year, month, day}` triple as written in the model specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl CalendarDate {
    pub const fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    /// Midnight at the start of this date.
    pub fn to_datetime(&self) -> Result<NaiveDateTime, WashoutError> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| {
                WashoutError::Configuration(format!(
                    "{}-{:02}-{:02} is not a calendar date",
                    self.year, self.month, self.day
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WashoutConfig {
    pub program_start: CalendarDate,
    /// Years.
    pub duration: u32,
}

impl Default for WashoutConfig {
    fn default() -> Self {
        Self {
            program_start: CalendarDate::new(2000, 7, 9),
            duration: 5,
        }
    }
}

impl WashoutConfig {
    pub fn program_start_time(&self) -> Result<NaiveDateTime, WashoutError> {
        self.program_start.to_datetime()
    }

    /// `program_start + duration`, with 365.25-day years.
    pub fn period_end(&self) -> Result<NaiveDateTime, WashoutError> {
        Ok(self.program_start_time()? + years(self.duration))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmiMetricsConfig {
    pub by_age: bool,
    pub by_year: bool,
    pub by_sex: bool,
    pub washout: WashoutConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub bmi: BmiMetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub start: CalendarDate,
    pub end: CalendarDate,
    /// Days.
    pub step_size: f64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            start: CalendarDate::new(2000, 1, 1),
            end: CalendarDate::new(2010, 12, 31),
            step_size: 28.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputDataConfig {
    pub location: String,
}

impl Default for InputDataConfig {
    fn default() -> Self {
        Self {
            location: "United States".to_string(),
        }
    }
}

/// The `configuration` block of a model specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub input_data: InputDataConfig,
    pub time: TimeConfig,
    pub metrics: MetricsConfig,
}

impl SimulationConfig {
    pub fn start_time(&self) -> Result<NaiveDateTime, WashoutError> {
        self.time.start.to_datetime()
    }

    pub fn step_size(&self) -> TimeDelta {
        days(self.time.step_size)
    }

    /// Checks everything that can be checked without a running simulation.
    /// The program-start vs. simulation-start ordering is left to observer
    /// setup, where it is a setup failure.
    pub fn validate(&self) -> Result<(), WashoutError> {
        let start = self.time.start.to_datetime()?;
        let end = self.time.end.to_datetime()?;
        if end <= start {
            return Err(WashoutError::Configuration(format!(
                "Simulation end {end} must be after simulation start {start}"
            )));
        }
        if !(self.time.step_size.is_finite() && self.time.step_size > 0.0) {
            return Err(WashoutError::Configuration(format!(
                "Step size must be a positive number of days, got {}",
                self.time.step_size
            )));
        }
        if self.input_data.location.trim().is_empty() {
            return Err(WashoutError::Configuration(
                "input_data.location must not be empty".to_string(),
            ));
        }
        let washout = &self.metrics.bmi.washout;
        washout.program_start_time()?;
        if washout.duration == 0 {
            return Err(WashoutError::Configuration(
                "metrics.bmi.washout.duration must be at least one year".to_string(),
            ));
        }
        Ok(())
    }
}

/// A model specification file. Only the `configuration` block is read here;
/// component and plugin blocks belong to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpecification {
    pub configuration: SimulationConfig,
}

impl ModelSpecification {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, WashoutError> {
        let spec: ModelSpecification = serde_yaml::from_str(yaml)?;
        spec.configuration.validate()?;
        Ok(spec)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WashoutError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn location(&self) -> &str {
        &self.configuration.input_data.location
    }
}
