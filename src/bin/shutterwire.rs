//! Command-line controller and device emulator.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shutterwire::emulator::DeviceEmulator;
use shutterwire::{ClientBuilder, Config, DirectoryStore, Events, SessionEvent};

/// Idle bound for one-shot commands, in seconds.
const DEFAULT_WAIT_SECS: u64 = 30;

/// Environment variable that controls log filtering.
const LOG_ENV_VAR: &str = "RUST_LOG";

#[derive(Debug, Parser)]
#[command(name = "shutterwire", version, about = "Remote camera control and photo transfer")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "SHUTTERWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable detailed debug output
    #[arg(short = 'v', long, global = true)]
    debug: bool,

    /// Print session events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Connect, take one photo and save it
    Capture {
        /// Device address (`host` or `host:port`)
        address: Option<String>,
        /// Directory for the photo (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// File name prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Give up after this many seconds without data
        #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
        wait: u64,
    },
    /// Check that the device answers heartbeats
    Ping {
        /// Device address (`host` or `host:port`)
        address: Option<String>,
        /// Give up after this many seconds without data
        #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
        wait: u64,
    },
    /// Run the device emulator
    Emulate {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,
        /// Image to serve on capture
        #[arg(long)]
        photo: Option<PathBuf>,
        /// Send short replies without a trailing newline
        #[arg(long)]
        omit_newlines: bool,
        /// Write the payload in pieces of this many bytes
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Answer captures with this error instead of a photo
        #[arg(long)]
        fail_capture: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.debug) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr, filtered by `RUST_LOG` or else by the debug flag.
fn init_tracing(debug: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(filter) => filter,
        Err(e) if std::env::var(LOG_ENV_VAR).is_ok() => {
            bail!("{LOG_ENV_VAR} (set in environment) was not understood: {e}")
        }
        Err(_) => {
            let level = if debug { "debug" } else { "info" };
            EnvFilter::try_new(format!("shutterwire={level}"))?
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => Config::default(),
    };

    match cli.mode {
        Mode::Capture {
            address,
            output,
            prefix,
            wait,
        } => {
            let address = device_address(address, &config)?;
            let directory = output
                .or_else(|| config.store.directory.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            let prefix = prefix.unwrap_or_else(|| config.store.prefix.clone());

            let (client, mut events) = ClientBuilder::from_config(config.session)
                .idle_timeout(Duration::from_secs(wait))
                .store(DirectoryStore::new(directory, prefix))
                .build();

            client
                .connect(&address)
                .await
                .with_context(|| format!("Failed to connect to {address}"))?;

            let mut result = Ok(false);
            while let Some(event) = events.recv().await {
                report(&event, cli.json)?;
                match event {
                    SessionEvent::Connected => {
                        if let Err(e) = client.take_photo() {
                            result = Err(e).context("Failed to request a photo");
                            break;
                        }
                    }
                    SessionEvent::PhotoReceived(_) => {
                        result = Ok(true);
                        break;
                    }
                    SessionEvent::Error { .. } | SessionEvent::Disconnected { .. } => break,
                    _ => {}
                }
            }

            client.disconnect().await;
            drain(&mut events, cli.json)?;
            result
        }

        Mode::Ping { address, wait } => {
            let address = device_address(address, &config)?;
            let (client, mut events) = ClientBuilder::from_config(config.session)
                .idle_timeout(Duration::from_secs(wait))
                .build();

            client
                .connect(&address)
                .await
                .with_context(|| format!("Failed to connect to {address}"))?;

            let mut answered = false;
            while let Some(event) = events.recv().await {
                report(&event, cli.json)?;
                match event {
                    SessionEvent::Connected => {
                        if !client.ping() {
                            break;
                        }
                    }
                    SessionEvent::HeartbeatAck => {
                        answered = true;
                        break;
                    }
                    SessionEvent::Error { .. } | SessionEvent::Disconnected { .. } => break,
                    _ => {}
                }
            }

            client.disconnect().await;
            drain(&mut events, cli.json)?;
            Ok(answered)
        }

        Mode::Emulate {
            bind,
            photo,
            omit_newlines,
            chunk_size,
            fail_capture,
        } => {
            let mut emulator = config.emulator;
            if let Some(bind) = bind {
                emulator.bind = bind;
            }
            emulator.photo = photo.or(emulator.photo);
            emulator.omit_newlines |= omit_newlines;
            emulator.chunk_size = chunk_size.or(emulator.chunk_size);
            emulator.fail_capture = fail_capture.or(emulator.fail_capture);

            let bind = emulator.bind.clone();
            DeviceEmulator::bind(emulator)
                .await
                .with_context(|| format!("Failed to start emulator on {bind}"))?
                .run()
                .await?;
            Ok(true)
        }
    }
}

fn device_address(address: Option<String>, config: &Config) -> Result<String> {
    address
        .or_else(|| config.session.address.clone())
        .context("No device address given; pass one or set session.address in the config file")
}

/// Report events left over after disconnecting.
fn drain(events: &mut Events, json: bool) -> Result<()> {
    while let Some(event) = events.try_recv() {
        report(&event, json)?;
    }
    Ok(())
}

fn report(event: &SessionEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        SessionEvent::Connected => println!("Connected"),
        SessionEvent::Disconnected { reason } => println!("Disconnected: {reason}"),
        SessionEvent::PhotoReceived(photo) => match &photo.path {
            Some(path) => println!("Photo received: {} bytes, saved to {}", photo.len(), path.display()),
            None => println!("Photo received: {} bytes", photo.len()),
        },
        SessionEvent::Error { message } => eprintln!("Error: {message}"),
        SessionEvent::Warning { message } => eprintln!("Warning: {message}"),
        SessionEvent::Log { message } => println!("{message}"),
        SessionEvent::Progress { percent } => println!("Progress: {percent}%"),
        SessionEvent::HeartbeatAck => println!("PONG"),
    }
    Ok(())
}
