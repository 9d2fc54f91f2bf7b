use std::{env, io::Read, num::NonZeroU64};

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use tally::{
    EntityId, Engine, Handle, Metric,
    config::{Config, Telemetry},
    engine,
    scheduler::ShutdownReport,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    runtime::Builder,
    signal,
    time::Duration,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load tally config: {0}")]
    Config(#[from] tally::config::Error),
    #[error("Tally engine failed to start: {0}")]
    Engine(#[from] engine::Error),
}

fn default_config_path() -> String {
    "/etc/tally/tally.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tally, reading events from stdin until EOF or ctrl-c
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the maximum time to wait, in seconds, for the runtime to shut down
    /// after the drain completes
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

/// One line of input.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
enum Event {
    Increment {
        entity: EntityId,
        metric: Metric,
        #[serde(default = "one")]
        delta: NonZeroU64,
    },
    SessionEnd {
        entity: EntityId,
    },
}

fn one() -> NonZeroU64 {
    NonZeroU64::MIN
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("TALLY_CONFIG") {
        debug!("Using config from env var 'TALLY_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {}", config_path);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{}': {}", config_path, err);
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn parse_config(contents: &str) -> Result<Config, Error> {
    Config::from_yaml(contents).map_err(|err| {
        error!("Configuration validation failed: {}", err);
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    let config = parse_config(&contents)?;
    info!("Configuration file is valid");
    Ok(config)
}

async fn ingest(handle: &Handle, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Event>(line) {
        Ok(Event::Increment {
            entity,
            metric,
            delta,
        }) => handle.increment(&entity, metric, delta).await,
        Ok(Event::SessionEnd { entity }) => handle.session_end(&entity),
        Err(err) => warn!("Skipping malformed event {line:?}: {err}"),
    }
}

async fn inner_main<R>(config: Config, input: R) -> Result<ShutdownReport, Error>
where
    R: AsyncBufRead + Unpin,
{
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = config.telemetry.clone()
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        tokio::spawn(async move {
            if let Err(err) = builder.install() {
                error!("Failed to install prometheus recorder: {err}");
            }
        });
    }

    let engine = Engine::start(&config).await?;
    let handle = engine.handle();

    let mut lines = input.lines();
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Received ctrl-c, shutting down."),
                    Err(err) => error!("Failed to listen for ctrl-c, shutting down: {err}"),
                }
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => ingest(&handle, &line).await,
                    Ok(None) => {
                        info!("Input closed, shutting down.");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to read input, shutting down: {err}");
                        break;
                    }
                }
            }
        }
    }

    let report = engine.shutdown().await;
    info!(
        "Drain complete: {} flushed, {} failed, {} still dirty.",
        report.flushed, report.failed, report.remaining
    );
    Ok(report)
}

/// `RUST_LOG` wins; otherwise the config's debug flag picks the level.
fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "info,tally=debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .finish()
        .init();
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let cmd = match cli.command {
        Commands::Run(cmd) => cmd,
        Commands::ConfigCheck(cmd) => {
            init_tracing(false);
            match validate_config(&cmd.config_path) {
                Ok(_) => std::process::exit(0),
                Err(_) => std::process::exit(1),
            }
        }
    };

    // The log level depends on the config, so nothing is logged until it
    // has been read. Load failures still surface through the returned error.
    let config = parse_config(&load_config_contents(&cmd.config_path)?)?;
    init_tracing(config.debug);

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tally {version}.");
    let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, BufReader::new(tokio::io::stdin())));
    info!(
        "Shutting down runtime with a {} second delay.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_parse() {
        let event: Event =
            serde_json::from_str(r#"{"increment":{"entity":"alice","metric":"blocks_broken","delta":5}}"#)
                .expect("valid event");
        assert_eq!(
            event,
            Event::Increment {
                entity: EntityId::from("alice"),
                metric: Metric::BlocksBroken,
                delta: NonZeroU64::new(5).expect("non-zero"),
            }
        );

        let event: Event = serde_json::from_str(r#"{"increment":{"entity":"bob","metric":"mobs_killed"}}"#)
            .expect("valid event");
        assert_eq!(
            event,
            Event::Increment {
                entity: EntityId::from("bob"),
                metric: Metric::MobsKilled,
                delta: NonZeroU64::MIN,
            }
        );

        let event: Event =
            serde_json::from_str(r#"{"session_end":{"entity":"bob"}}"#).expect("valid event");
        assert_eq!(
            event,
            Event::SessionEnd {
                entity: EntityId::from("bob")
            }
        );
    }

    #[test]
    fn bad_events_are_rejected() {
        for line in [
            r#"{"increment":{"entity":"alice","metric":"blocks_broken","delta":0}}"#,
            r#"{"increment":{"entity":"alice","metric":"diamonds_found"}}"#,
            r#"{"teleport":{"entity":"alice"}}"#,
            "not json",
        ] {
            assert!(serde_json::from_str::<Event>(line).is_err(), "accepted: {line}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_drains_on_eof() {
        let tmp_dir = tempfile::tempdir().expect("directory could not be created");
        let contents = format!(
            "durable_store:\n  sqlite:\n    path: {:?}\n",
            tmp_dir.path().join("durable.db")
        );
        let config = parse_config(&contents).expect("valid config");

        let input = concat!(
            r#"{"increment":{"entity":"alice","metric":"blocks_broken","delta":5}}"#,
            "\n",
            "garbage\n",
            r#"{"increment":{"entity":"alice","metric":"mobs_killed","delta":2}}"#,
            "\n",
            r#"{"session_end":{"entity":"alice"}}"#,
            "\n",
            r#"{"increment":{"entity":"bob","metric":"blocks_placed"}}"#,
            "\n",
        );
        let report = inner_main(config, BufReader::new(input.as_bytes()))
            .await
            .expect("inner_main succeeds");
        assert_eq!(report.remaining, 0);
        assert_eq!(report.failed, 0);
    }
}
