//! Command implementations for the Quiver CLI.

use std::fmt;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use crate::cli::args::*;
use crate::engine::{Engine, EngineConfig};
use crate::error::{QuiverError, Result};
use crate::server;

/// Printed when the server cannot be brought up in this process.
pub const CONTAINER_HINT: &str = "If the engine cannot run in this environment, run the \
     published container image instead: docker run -p 8000:8000 quiver:latest";

/// Execute a CLI command.
pub fn execute_command(args: QuiverArgs) -> Result<()> {
    match &args.command {
        Command::Start(start_args) => start(start_args, &args),
    }
}

/// One way of bringing an engine up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStrategy {
    /// Files under the data directory; survives restarts.
    Persistent,
    /// Everything in memory; lost on shutdown.
    Ephemeral,
}

impl StartupStrategy {
    fn start(self, config: &EngineConfig) -> Result<Engine> {
        match self {
            StartupStrategy::Persistent => Engine::start(config.clone().with_in_memory(false)),
            StartupStrategy::Ephemeral => Engine::start(config.clone().with_in_memory(true)),
        }
    }
}

impl fmt::Display for StartupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupStrategy::Persistent => write!(f, "persistent"),
            StartupStrategy::Ephemeral => write!(f, "in-memory"),
        }
    }
}

/// Strategies to try, in order.
pub fn startup_strategies(config: &EngineConfig, allow_ephemeral: bool) -> Vec<StartupStrategy> {
    if config.in_memory {
        return vec![StartupStrategy::Ephemeral];
    }
    let mut strategies = vec![StartupStrategy::Persistent];
    if allow_ephemeral {
        strategies.push(StartupStrategy::Ephemeral);
    }
    strategies
}

/// Merge the configuration file with command line overrides.
pub fn resolve_config(args: &StartArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Try each strategy until one yields a running engine.
pub fn start_engine(config: &EngineConfig, allow_ephemeral: bool) -> Result<(Engine, StartupStrategy)> {
    let mut last_error = None;
    for strategy in startup_strategies(config, allow_ephemeral) {
        match strategy.start(config) {
            Ok(engine) => {
                log::info!("Started {strategy} engine");
                return Ok((engine, strategy));
            }
            Err(e) => {
                log::warn!("Could not start {strategy} engine: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| QuiverError::other("no startup strategy available")))
}

/// An engine that is up, with the socket it will serve on.
struct Ready {
    engine: Arc<Engine>,
    strategy: StartupStrategy,
    listener: TcpListener,
}

/// Start an engine and bind the listening socket. Any error here means the
/// server could not be brought up in this process.
fn prepare(runtime: &Runtime, config: &EngineConfig, args: &StartArgs) -> Result<Ready> {
    let (engine, strategy) = start_engine(config, args.allow_ephemeral)?;
    match runtime.block_on(server::bind(&args.host, args.port)) {
        Ok(listener) => Ok(Ready {
            engine: Arc::new(engine),
            strategy,
            listener,
        }),
        Err(e) => {
            if let Err(stop_err) = engine.stop() {
                log::warn!("Could not stop engine after failed bind: {stop_err}");
            }
            Err(e)
        }
    }
}

/// Start the engine and serve the HTTP API until Ctrl-C.
fn start(args: &StartArgs, cli_args: &QuiverArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("quiver-http")
        .build()?;

    let Ready {
        engine,
        strategy,
        listener,
    } = match prepare(&runtime, &config, args) {
        Ok(ready) => ready,
        Err(e) => {
            eprintln!("{CONTAINER_HINT}");
            return Err(e);
        }
    };

    if strategy == StartupStrategy::Ephemeral && !config.in_memory {
        log::warn!(
            "Data directory {} is unusable; running in memory, nothing will be persisted",
            config.data_dir.display()
        );
    }

    let served = runtime.block_on(async {
        if cli_args.verbosity() > 0 {
            println!(
                "Quiver {} ({strategy}) listening on http://{}",
                crate::VERSION,
                listener.local_addr()?
            );
        }
        server::serve(engine.clone(), listener, shutdown_signal()).await
    });

    let stopped = engine.stop();
    if cli_args.verbosity() > 0 && stopped.is_ok() {
        println!("Quiver stopped");
    }
    served.and(stopped)
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Interrupt received, shutting down"),
        Err(e) => {
            log::error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn start_args(argv: &[&str]) -> StartArgs {
        let mut full = vec!["quiver", "start"];
        full.extend_from_slice(argv);
        let Command::Start(args) = QuiverArgs::try_parse_from(full).unwrap().command;
        args
    }

    #[test]
    fn test_strategy_order() {
        let config = EngineConfig::default();
        assert_eq!(
            startup_strategies(&config, false),
            vec![StartupStrategy::Persistent]
        );
        assert_eq!(
            startup_strategies(&config, true),
            vec![StartupStrategy::Persistent, StartupStrategy::Ephemeral]
        );
        assert_eq!(
            startup_strategies(&EngineConfig::in_memory(), false),
            vec![StartupStrategy::Ephemeral]
        );
    }

    #[test]
    fn test_data_dir_flag_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"data_dir": "/from/file", "compaction": {{"auto": true}}}}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = resolve_config(&start_args(&["--config", path.as_str()])).unwrap();
        assert_eq!(config.data_dir, std::path::PathBuf::from("/from/file"));
        assert!(config.compaction.auto);

        let config =
            resolve_config(&start_args(&["--config", path.as_str(), "--data-dir", "/from/flag"])).unwrap();
        assert_eq!(config.data_dir, std::path::PathBuf::from("/from/flag"));
        assert!(config.compaction.auto);
    }

    #[test]
    fn test_persistent_start() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default().with_data_dir(dir.path());
        let (engine, strategy) = start_engine(&config, false).unwrap();
        assert_eq!(strategy, StartupStrategy::Persistent);
        assert!(engine.is_persistent());
        engine.stop().unwrap();
    }

    #[test]
    fn test_bind_failure_is_a_startup_failure() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port().to_string();
        let args = start_args(&["--host", "127.0.0.1", "--port", port.as_str()]);

        let result = prepare(&runtime, &EngineConfig::in_memory(), &args);
        assert!(result.is_err());

        let args = start_args(&["--host", "127.0.0.1", "--port", "0"]);
        let ready = prepare(&runtime, &EngineConfig::in_memory(), &args).unwrap();
        assert_eq!(ready.strategy, StartupStrategy::Ephemeral);
        assert_ne!(ready.listener.local_addr().unwrap().port(), 0);
        ready.engine.stop().unwrap();
    }

    #[test]
    fn test_ephemeral_fallback_only_when_allowed() {
        // A regular file cannot serve as the data directory.
        let file = NamedTempFile::new().unwrap();
        let config = EngineConfig::default().with_data_dir(file.path());

        assert!(start_engine(&config, false).is_err());

        let (engine, strategy) = start_engine(&config, true).unwrap();
        assert_eq!(strategy, StartupStrategy::Ephemeral);
        assert!(!engine.is_persistent());
        engine.stop().unwrap();
    }
}
