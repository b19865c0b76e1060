//! stransfer - Serial Transfer Driver
//!
//! Reads a transfer from a device, sends a file as one transfer, or reads a
//! transfer and writes it straight back (useful to check a link end to end).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stransfer_core::prelude::*;
use stransfer_core::protocol::{DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_SECS};

/// stransfer - framed, checksummed transfers over serial links
#[derive(Parser, Debug)]
#[command(name = "stransfer")]
#[command(version)]
#[command(about = "Framed, checksummed transfers over serial links", long_about = None)]
struct Cli {
    /// Device to open (COM10, /dev/ttyUSB0, or host:port with --tcp)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, global = true, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Transport read timeout in seconds
    #[arg(long, global = true, default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    read_timeout: f64,

    /// Response window per attempt in seconds
    #[arg(short, long, global = true)]
    timeout: Option<f64>,

    /// Attempts per read or write
    #[arg(short, long, global = true)]
    attempts: Option<u32>,

    /// Wait for unsolicited data instead of sending read requests
    #[arg(long, global = true)]
    listen: bool,

    /// Do not exchange acknowledgements
    #[arg(long, global = true)]
    no_ack: bool,

    /// Treat the port as a TCP host:port address
    #[arg(long, global = true)]
    tcp: bool,

    /// Path to a JSON session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Report every frame, retry and failure
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read one transfer
    Read {
        /// Save the package bytes to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send a file as one transfer
    Write {
        /// File whose bytes become the package
        #[arg(short, long)]
        input: PathBuf,

        /// Device identifier
        #[arg(long, default_value_t = 0)]
        device: u16,

        /// Channel identifier
        #[arg(long, default_value_t = 0)]
        channel: u8,

        /// Session identifier
        #[arg(long, default_value_t = 0)]
        session: u32,

        /// Sequence number
        #[arg(long, default_value_t = 0)]
        sequence: u32,
    },

    /// Read one transfer and write it back
    Echo,

    /// Print (or save) the effective session configuration
    Config {
        /// Write the configuration to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise verbose shows the session's info-level reports
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = session_config(&cli)?;

    match &cli.command {
        Commands::Read { output } => {
            let mut session = open_session(&cli, config)?;
            let (global, package) = session.read().context("Read error")?;
            print_transfer(&global, &package);
            if let Some(path) = output {
                fs::write(path, package.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Package written to: {}", path.display());
            }
        }
        Commands::Write {
            input,
            device,
            channel,
            session: session_id,
            sequence,
        } => {
            let bytes =
                fs::read(input).with_context(|| format!("reading {}", input.display()))?;
            let package = PackageRecord::new(bytes);
            let global =
                GlobalRecord::for_package(*device, *channel, *session_id, *sequence, &package);

            let mut session = open_session(&cli, config)?;
            session.write(&global, &package).context("Write error")?;
            println!("Write success!");
        }
        Commands::Echo => {
            let mut session = open_session(&cli, config)?;
            let (global, package) = session.read().context("Read error")?;
            print_transfer(&global, &package);
            session.write(&global, &package).context("Write error")?;
            println!("Write success!");
            info!("echo: {:?}", session.stats());
        }
        Commands::Config { output } => {
            if let Some(path) = output {
                config
                    .save(path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{:#?}", config);
            }
        }
    }

    Ok(())
}

/// Load the configuration file (if any) and apply command-line overrides
fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(attempts) = cli.attempts {
        config.max_attempts = attempts;
    }
    if cli.listen {
        config.read_mode = ReadMode::Listen;
    }
    if cli.no_ack {
        config.require_ack = false;
    }
    config.verbose |= cli.verbose;

    config.validate()?;
    Ok(config)
}

fn open_session(
    cli: &Cli,
    config: SessionConfig,
) -> Result<TransferSession<Box<dyn Connector>>> {
    let port = cli
        .port
        .as_deref()
        .context("--port is required for transfers")?;

    let connector: Box<dyn Connector> = if cli.tcp {
        Box::new(TcpConnector)
    } else {
        Box::new(SerialConnector)
    };

    let mut session = TransferSession::new(connector, config)?;
    session
        .init(port, cli.baud, cli.read_timeout)
        .with_context(|| format!("opening {}", port))?;
    Ok(session)
}

fn print_transfer(global: &GlobalRecord, package: &PackageRecord) {
    println!(
        "Read success: global data size: {}, package data size: {}",
        GlobalRecord::SIZE,
        package.len()
    );
    println!(
        "  device={} channel={} session={} sequence={}",
        global.device_id, global.channel, global.session_id, global.sequence
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write_command() {
        let cli = Cli::try_parse_from([
            "stransfer",
            "--port",
            "COM10",
            "write",
            "--input",
            "data.bin",
            "--device",
            "3",
            "--sequence",
            "9",
        ])
        .unwrap();

        assert_eq!(cli.port.as_deref(), Some("COM10"));
        assert_eq!(cli.baud, DEFAULT_BAUD_RATE);
        match cli.command {
            Commands::Write {
                input,
                device,
                sequence,
                ..
            } => {
                assert_eq!(input, PathBuf::from("data.bin"));
                assert_eq!(device, 3);
                assert_eq!(sequence, 9);
            }
            other => panic!("Expected write command, got {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "stransfer", "read", "--timeout", "0.5", "--attempts", "5", "--listen", "--no-ack",
            "-v",
        ])
        .unwrap();

        let config = session_config(&cli).unwrap();
        assert_eq!(config.timeout_secs, 0.5);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.read_mode, ReadMode::Listen);
        assert!(!config.require_ack);
        assert!(config.verbose);
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        let mut saved = SessionConfig::default();
        saved.device_id = 12;
        saved.max_attempts = 7;
        saved.save(&path).unwrap();

        let cli = Cli::try_parse_from([
            "stransfer",
            "--config",
            path.to_str().unwrap(),
            "echo",
        ])
        .unwrap();
        let config = session_config(&cli).unwrap();
        assert_eq!(config.device_id, 12);
        assert_eq!(config.max_attempts, 7);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let cli = Cli::try_parse_from(["stransfer", "read", "--attempts", "0"]).unwrap();
        assert!(session_config(&cli).is_err());
    }

    #[test]
    fn test_transfer_requires_port() {
        let cli = Cli::try_parse_from(["stransfer", "read"]).unwrap();
        let err = open_session(&cli, SessionConfig::default()).err().unwrap();
        assert!(err.to_string().contains("--port"));
    }
}
