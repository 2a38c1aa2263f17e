use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;
use telemetry::prelude::*;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Report parcel weight, volume and fee readings to the package server")]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// TOML configuration file (takes precedence over the flags below)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// WiFi network name
    #[arg(long, global = true)]
    ssid: Option<String>,
    /// WiFi password
    #[arg(long, global = true, default_value = "")]
    password: String,
    /// Server host, or a full URL starting with http:// or https://
    #[arg(long, global = true)]
    server: Option<String>,
    /// Server port (ignored when --server is a full URL)
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Device API key sent as x-api-key
    #[arg(long, global = true)]
    api_key: Option<String>,
}

/// Overrides for the `[ingest]` configuration section
#[derive(Args, Default)]
struct FilterArgs {
    /// Minimum weight change that counts as a new reading
    #[arg(long)]
    weight_threshold: Option<f64>,
    /// Minimum volume change that counts as a new reading
    #[arg(long)]
    volume_threshold: Option<f64>,
    /// Minimum fee change that counts as a new reading
    #[arg(long)]
    fee_threshold: Option<f64>,
    /// Repeat an unchanged reading at most this often
    #[arg(long)]
    min_interval_ms: Option<u64>,
}

impl FilterArgs {
    fn apply(&self, ingest: &mut IngestConfig) {
        if let Some(value) = self.weight_threshold {
            ingest.weight_threshold = value;
        }
        if let Some(value) = self.volume_threshold {
            ingest.volume_threshold = value;
        }
        if let Some(value) = self.fee_threshold {
            ingest.fee_threshold = value;
        }
        if let Some(value) = self.min_interval_ms {
            ingest.min_interval_ms = value;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Associate with the network
    Connect {
        /// Maximum time to wait for association (defaults to connect_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Send a single reading
    Report {
        #[arg(long)]
        weight: f64,
        #[arg(long)]
        volume: f64,
        /// Fee type tag, e.g. "A"
        #[arg(long)]
        fee_type: String,
        #[arg(long)]
        fee: f64,
    },
    /// Read scale controller output and report readings that changed
    Ingest {
        /// File to read instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print the URL readings are posted to
    Url,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = load_config(&cli.target)?;
    if let Commands::Ingest { filter, .. } = &cli.command {
        filter.apply(&mut config.ingest);
    }
    let mut reporter = TelemetryReporter::new(config, HostLink::new())?;

    match cli.command {
        Commands::Connect { timeout_ms } => {
            connect(&mut reporter, timeout_ms.map(Duration::from_millis)).await?;
        }
        Commands::Report {
            weight,
            volume,
            fee_type,
            fee,
        } => {
            report(&mut reporter, Reading::new(weight, volume, fee_type, fee)).await?;
        }
        Commands::Ingest { input, .. } => {
            ingest(&mut reporter, input).await?;
        }
        Commands::Url => {
            println!("{}", reporter.target_url());
        }
    }

    Ok(())
}

fn load_config(target: &TargetArgs) -> Result<ReporterConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &target.config {
        info!("Loading configuration from {}", path.display());
        return Ok(ReporterConfig::load(path)?);
    }

    let ssid = target
        .ssid
        .clone()
        .ok_or("--ssid is required when no --config is given")?;
    let server = target
        .server
        .as_deref()
        .ok_or("--server is required when no --config is given")?;

    let mut config = ReporterConfig::new(
        NetworkCredentials::new(ssid, target.password.clone()),
        Endpoint::from_address(server, target.port),
    );
    if let Some(api_key) = &target.api_key {
        config = config.with_api_key(api_key.clone());
    }

    Ok(config)
}

async fn connect<L: NetworkLink>(
    reporter: &mut TelemetryReporter<L>,
    timeout: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let connected = match timeout {
        Some(timeout) => reporter.connect(timeout).await,
        None => reporter.connect_default().await,
    };
    let timeout = timeout.unwrap_or_else(|| reporter.config().connect_timeout());

    if connected {
        println!("✓ Associated with {}", reporter.config().network.ssid);
        Ok(())
    } else {
        Err(format!(
            "could not associate with {} within {}ms",
            reporter.config().network.ssid,
            timeout.as_millis()
        )
        .into())
    }
}

async fn report<L: NetworkLink>(
    reporter: &mut TelemetryReporter<L>,
    reading: Reading,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = reporter.try_report(&reading).await?;
    println!("✓ Reported to {} ({})", reporter.target_url(), status);
    Ok(())
}

async fn ingest<L: NetworkLink>(
    reporter: &mut TelemetryReporter<L>,
    input: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let source: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut parser = ScaleLineParser::new();
    let mut filter = ReadingFilter::new(reporter.config().ingest.clone());
    let mut sent = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for line in source.lines() {
        let line = line?;
        let Some(reading) = parser.feed_line(&line) else {
            continue;
        };

        if !filter.admit(&reading) {
            debug!(
                "Skipping unchanged reading weight={} volume={} fee={}",
                reading.weight, reading.volume, reading.fee
            );
            skipped += 1;
            continue;
        }

        if reporter.send(&reading).await {
            sent += 1;
        } else {
            error!(
                "Dropped reading weight={} volume={} fee={}",
                reading.weight, reading.volume, reading.fee
            );
            failed += 1;
        }
    }

    if parser.has_partial() {
        info!("Input ended with an incomplete reading; discarded");
    }

    println!(
        "Readings sent: {}, skipped: {}, failed: {}",
        sent, skipped, failed
    );

    if failed > 0 {
        return Err(format!("{} reading(s) could not be reported", failed).into());
    }

    Ok(())
}
