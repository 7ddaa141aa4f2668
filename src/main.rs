//! Runs every experiment once with logging enabled.
//!
//! The unguarded visibility run is skipped unless `--unguarded` is passed,
//! since its reader may spin for the whole timeout.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use visibility_harness::{
    Guarantee, RaceConfig, RaceExperiment, ShutdownConfig, ShutdownCoordinator, SingletonConfig,
    SingletonExperiment, VisibilityConfig, VisibilityExperiment,
};

fn run(unguarded: bool) -> visibility_harness::Result<()> {
    if unguarded {
        info!("1. flag without a visibility guarantee");
        let config = VisibilityConfig::default().with_guarantee(Guarantee::None);
        let verdict = VisibilityExperiment::new(config).run()?.verdict()?;
        info!(?verdict, "unguarded run finished");
    }

    info!("2. flag with a visibility guarantee");
    let verdict = VisibilityExperiment::new(VisibilityConfig::default())
        .run()?
        .verdict()?;
    info!(?verdict, "guarded run finished");

    info!("3. visibility is not atomicity");
    let racy = RaceExperiment::new(RaceConfig::default()).run()?;
    let atomic = RaceExperiment::new(RaceConfig::default().atomic()).run()?;
    info!(
        expected = racy.expected,
        racy = racy.observed,
        atomic = atomic.observed,
        "race finished"
    );

    info!("4. double-checked locking");
    let singleton = SingletonExperiment::new(SingletonConfig::default()).run()?;
    info!(
        same_instance = singleton.all_identical(),
        constructions = singleton.constructions,
        "singleton finished"
    );

    info!("5. graceful shutdown");
    let worker = ShutdownCoordinator::run(&ShutdownConfig::default())?;
    info!(iterations = worker.iterations, exit = ?worker.exit, "shutdown finished");

    Ok(())
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let unguarded = std::env::args().skip(1).any(|arg| arg == "--unguarded");
    match run(unguarded) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "experiment failed");
            ExitCode::FAILURE
        }
    }
}
