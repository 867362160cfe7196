#[cfg(feature = "python")]
use pyo3::exceptions::PyRuntimeError;
#[cfg(feature = "python")]
use pyo3::PyErr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WashoutError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Data not found: {0}")]
    DataNotFound(String),

    #[error("Value not registered: {0}")]
    ValueNotFound(String),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Artifact build failed: {0}")]
    Build(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("{0}")]
    General(String),
}

impl WashoutError {
    /// Abort-type failures are re-raised as-is by the CLI, never logged or
    /// handed to the post-mortem path.
    pub fn is_abort(&self) -> bool {
        matches!(self, WashoutError::Interrupted(_))
    }
}

#[cfg(feature = "python")]
impl From<WashoutError> for PyErr {
    fn from(err: WashoutError) -> PyErr {
        PyRuntimeError::new_err(err.to_string())
    }
}

#[cfg(feature = "python")]
impl From<PyErr> for WashoutError {
    fn from(err: PyErr) -> Self {
        WashoutError::General(err.to_string())
    }
}
