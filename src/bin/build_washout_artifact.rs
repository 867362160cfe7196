// src/bin/build_washout_artifact.rs
//
// Builds the obesity washout data artifact. The generic build runs as an
// external program; this binary then patches in asthma remission.

use std::error::Error as _;
use std::backtrace::Backtrace;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use obesity_washout::cli::{
    build_washout_artifact, handle_failure, measure_root, open_build_log, output_root,
    BuildOptions, ExternalPipeline, FailureAction, MODEL_SPECIFICATION,
};
use obesity_washout::measures::CsvMeasureSource;
use obesity_washout::WashoutError;

#[derive(Parser, Debug)]
#[command(name = "build_washout_artifact")]
struct Cli {
    /// Preserve existing artifact and add to it.
    #[arg(short, long)]
    append: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Drop into post-mortem inspection if an error occurs.
    #[arg(long)]
    pdb: bool,
}

fn post_mortem(err: &WashoutError) -> ! {
    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("caused by: {cause}");
        source = cause.source();
    }
    eprintln!("{}", Backtrace::force_capture());
    std::process::abort()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let output_root = output_root();

    let level = if cli.verbose { "debug" } else { "info" };
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    match open_build_log(&output_root, cli.append) {
        Ok(log) => {
            logger.target(env_logger::Target::Pipe(Box::new(log)));
        }
        Err(err) => eprintln!(
            "Failed to open build log under {}, logging to stderr only: {err}",
            output_root.display()
        ),
    }
    logger.init();

    let options = BuildOptions {
        append: cli.append,
        debugger: cli.pdb,
    };
    let pipeline = ExternalPipeline::from_env();
    let source = CsvMeasureSource::new(measure_root(&output_root));

    match build_washout_artifact(
        &options,
        &pipeline,
        &source,
        Path::new(MODEL_SPECIFICATION),
        &output_root,
    ) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => match handle_failure(&err, options.debugger) {
            FailureAction::PostMortem => post_mortem(&err),
            FailureAction::Propagate => {
                eprintln!("{err}");
                match err {
                    // 128 + SIGINT, as a shell reports an interrupted job.
                    WashoutError::Interrupted(_) => ExitCode::from(130),
                    _ => ExitCode::FAILURE,
                }
            }
        },
    }
}
