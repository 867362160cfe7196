//! Access to epidemiological measures outside the generic artifact pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use polars::prelude::*;

use crate::error::WashoutError;
use crate::schema::lookup;

/// Model version holding asthma remission estimates. Located by hand in the
/// epidemiology visualization tool; the generic pipeline does not know it.
pub const ASTHMA_DISMOD_ID: u32 = 1907;

pub const ASTHMA_CAUSE: &str = "asthma";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureRequest {
    pub cause: String,
    pub measure: String,
    pub location: String,
    /// Pin a specific model version instead of the cause's best model.
    pub model_version_id: Option<u32>,
}

impl MeasureRequest {
    pub fn new(cause: &str, measure: &str, location: &str) -> Self {
        Self {
            cause: cause.to_string(),
            measure: measure.to_string(),
            location: location.to_string(),
            model_version_id: None,
        }
    }

    pub fn with_model_version(mut self, id: u32) -> Self {
        self.model_version_id = Some(id);
        self
    }
}

impl fmt::Display for MeasureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} for {}", self.cause, self.measure, self.location)?;
        if let Some(id) = self.model_version_id {
            write!(f, " (model version {id})")?;
        }
        Ok(())
    }
}

pub trait MeasureSource {
    /// One measure for one location, with `age` and `year` as interval
    /// strings and a numeric `value`.
    fn get_measure(&self, request: &MeasureRequest) -> Result<DataFrame, WashoutError>;
}

/// Measures from CSV extracts laid out as `<root>/<model>/<measure>.csv`,
/// where `<model>` is the pinned model version id or else the cause name.
#[derive(Debug, Clone)]
pub struct CsvMeasureSource {
    root: PathBuf,
}

impl CsvMeasureSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, request: &MeasureRequest) -> PathBuf {
        let model = request
            .model_version_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| request.cause.clone());
        self.root.join(model).join(format!("{}.csv", request.measure))
    }
}

impl MeasureSource for CsvMeasureSource {
    fn get_measure(&self, request: &MeasureRequest) -> Result<DataFrame, WashoutError> {
        let path = self.path_for(request);
        debug!("Reading {request} from {}", path.display());
        let raw = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0)) // all columns as String
            .try_into_reader_with_file_path(Some(path.clone()))?
            .finish()?;

        for required in [lookup::LOCATION, lookup::VALUE] {
            if raw.column(required).is_err() {
                return Err(WashoutError::MissingColumn(format!(
                    "{required} in {}",
                    path.display()
                )));
            }
        }

        let df = raw
            .lazy()
            .filter(col(lookup::LOCATION).eq(lit(request.location.as_str())))
            .with_column(
                col(lookup::VALUE)
                    .str()
                    .strip_chars(lit(" \t\r\n"))
                    .cast(DataType::Float64),
            )
            .collect()?;

        if df.height() == 0 {
            return Err(WashoutError::DataNotFound(request.to_string()));
        }
        Ok(df)
    }
}
