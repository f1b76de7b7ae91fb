//! `sorng-profiled`: loads a daemon configuration, connects every profile
//! and keeps them up until interrupted.

use clap::Parser;
use sorng_profile::profile::{DaemonConfig, Engine, LogSink, TaskFault};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sorng-profiled", version, about)]
struct Args {
    /// JSON file with the engine settings and the profiles to run.
    config: PathBuf,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    #[cfg(feature = "logs-json")]
    builder.json().init();
    #[cfg(not(feature = "logs-json"))]
    builder.init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let config = match DaemonConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (engine, mut faults) = match Engine::new(config.engine, Arc::new(LogSink)) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!("Failed to initialise engine: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let engine = Arc::new(engine);

    tracing::info!("Starting {} profile(s)", config.profiles.len());
    for spec in config.profiles {
        let prfl = engine.profile(spec);
        if let Err(e) = prfl.start(true, false).await {
            tracing::error!("[{}] {}", prfl.id(), e);
        }
    }

    let fault: Option<TaskFault> = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Interrupted, disconnecting");
            None
        }
        fault = faults.recv() => fault,
    };

    engine.shutdown().await;

    match fault {
        Some(fault) => {
            tracing::error!("Exiting after background failure: {}", fault);
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}
