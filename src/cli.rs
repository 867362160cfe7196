//! Library side of `build_washout_artifact`.
//!
//! The generic artifact build is delegated to an external program; this
//! module only runs it and then patches in the asthma remission data that
//! the generic pipeline does not produce.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use log::{error, info};

use crate::artifact::{split_interval, Artifact};
use crate::config::ModelSpecification;
use crate::disease::measure;
use crate::error::WashoutError;
use crate::measures::{MeasureRequest, MeasureSource, ASTHMA_CAUSE, ASTHMA_DISMOD_ID};
use crate::schema::keys;

/// Model specification shipped with the repository.
pub const MODEL_SPECIFICATION: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/model_specifications/obesity_washout.yaml"
);
pub const ARTIFACT_NAME: &str = "obesity_washout";

pub const ARTIFACT_FOLDER_ENV: &str = "WASHOUT_ARTIFACT_FOLDER";
pub const DEFAULT_ARTIFACT_FOLDER: &str = "artifacts";
pub const BUILDER_ENV: &str = "WASHOUT_ARTIFACT_BUILDER";
pub const DEFAULT_BUILDER: &str = "build_artifact";
pub const MEASURE_ROOT_ENV: &str = "WASHOUT_MEASURE_ROOT";
pub const BUILD_LOG: &str = "build_washout_artifact.log";

/// `<artifact folder>/obesity_washout`
pub fn output_root() -> PathBuf {
    let folder = env::var(ARTIFACT_FOLDER_ENV).unwrap_or_else(|_| DEFAULT_ARTIFACT_FOLDER.to_string());
    PathBuf::from(folder).join(ARTIFACT_NAME)
}

/// Where the measure extracts live, defaulting to `<output_root>/extracts`.
pub fn measure_root(output_root: &Path) -> PathBuf {
    env::var(MEASURE_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| output_root.join("extracts"))
}

/// Log sink that copies every record to stderr and to the build log under
/// the output root.
pub struct BuildLog {
    file: File,
}

impl Write for BuildLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Open `<output_root>/build_washout_artifact.log`, continuing it when
/// appending and starting it over otherwise.
pub fn open_build_log(output_root: &Path, append: bool) -> io::Result<BuildLog> {
    fs::create_dir_all(output_root)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(output_root.join(BUILD_LOG))?;
    Ok(BuildLog { file })
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// The generic artifact build.
pub trait ArtifactPipeline {
    /// Build (or extend, when `append`) the artifact for `model_specification`
    /// under `output_root`; return the artifact's path.
    fn build(
        &self,
        model_specification: &Path,
        output_root: &Path,
        location: Option<&str>,
        append: bool,
    ) -> Result<PathBuf, WashoutError>;
}

/// Runs the artifact builder as a separate program.
#[derive(Debug, Clone)]
pub struct ExternalPipeline {
    program: String,
}

impl ExternalPipeline {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(&env::var(BUILDER_ENV).unwrap_or_else(|_| DEFAULT_BUILDER.to_string()))
    }
}

impl ArtifactPipeline for ExternalPipeline {
    fn build(
        &self,
        model_specification: &Path,
        output_root: &Path,
        location: Option<&str>,
        append: bool,
    ) -> Result<PathBuf, WashoutError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(model_specification).arg("--output-root").arg(output_root);
        if let Some(location) = location {
            cmd.arg("--location").arg(location);
        }
        if append {
            cmd.arg("--append");
        }
        info!("Running {cmd:?}");

        let status = cmd
            .status()
            .map_err(|e| WashoutError::Build(format!("could not start {}: {e}", self.program)))?;
        check_status(&self.program, status)?;
        Ok(output_root.join(ARTIFACT_NAME))
    }
}

fn check_status(program: &str, status: ExitStatus) -> Result<(), WashoutError> {
    if status.success() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(WashoutError::Interrupted(format!(
                "{program} terminated by signal {signal}"
            )));
        }
    }
    Err(WashoutError::Build(format!("{program} exited with {status}")))
}

// ── Patch ───────────────────────────────────────────────────────────────────

/// Write asthma remission into the artifact at `artifact_path`.
pub fn patch_artifact(
    artifact_path: &Path,
    spec: &ModelSpecification,
    source: &dyn MeasureSource,
) -> Result<(), WashoutError> {
    let request = MeasureRequest::new(ASTHMA_CAUSE, measure::REMISSION, spec.location())
        .with_model_version(ASTHMA_DISMOD_ID);
    let remission = source.get_measure(&request)?;
    let remission = split_interval(remission, "age", "age_group")?;
    let mut remission = split_interval(remission, "year", "year")?;

    let key = keys::cause(ASTHMA_CAUSE, measure::REMISSION);
    let mut artifact = Artifact::open(artifact_path)?;
    if artifact.contains(&key) {
        info!("Replacing {key} in {}", artifact.path().display());
        artifact.replace(&key, &mut remission)
    } else {
        info!("Writing {key} to {}", artifact.path().display());
        artifact.write(&key, &mut remission)
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub append: bool,
    pub debugger: bool,
}

/// Build the artifact for `model_specification` under `output_root`, then
/// patch it.
pub fn build_washout_artifact(
    options: &BuildOptions,
    pipeline: &dyn ArtifactPipeline,
    source: &dyn MeasureSource,
    model_specification: &Path,
    output_root: &Path,
) -> Result<PathBuf, WashoutError> {
    let spec = ModelSpecification::from_file(model_specification)?;
    info!(
        "Building artifact for {} ({}) in {}",
        model_specification.display(),
        spec.location(),
        output_root.display()
    );
    let artifact_path = pipeline.build(model_specification, output_root, None, options.append)?;
    patch_artifact(&artifact_path, &spec, source)?;
    info!("Artifact ready at {}", artifact_path.display());
    Ok(artifact_path)
}

/// What the binary does with a failed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Hand the error back unchanged.
    Propagate,
    /// Print the error chain and a backtrace, then abort for inspection.
    PostMortem,
}

/// Abort-type errors always propagate without logging; anything else is
/// logged and then propagated or handed to the post-mortem path.
pub fn handle_failure(err: &WashoutError, debugger: bool) -> FailureAction {
    if err.is_abort() {
        return FailureAction::Propagate;
    }
    error!("Uncaught exception: {err}");
    if debugger {
        FailureAction::PostMortem
    } else {
        FailureAction::Propagate
    }
}
