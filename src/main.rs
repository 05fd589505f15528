use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redshard::config::{Config, ConfigError};
use redshard::{GetOptions, RedshardError, SetOptions, ShardedClient};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "redshard")]
#[command(about = "A pipelining, ketama-sharded client for Redis-protocol key-value clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Redshard Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one key
    Get {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        key: String,
        /// Route by this key instead
        #[arg(long)]
        server_key: Option<String>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Store one key
    Set {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        key: String,
        value: String,
        /// Expiry in seconds
        #[arg(short, long)]
        expire: Option<u64>,
        /// Route by this key instead
        #[arg(long)]
        server_key: Option<String>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Fetch many keys across all shards
    Mget {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        #[arg(required = true)]
        keys: Vec<String>,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show which server owns each key, or the ring layout when no key is given
    Route {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        keys: Vec<String>,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Get {
            config,
            key,
            server_key,
            timeout_ms,
        } => {
            let client = connect(&config)?;
            let options = GetOptions {
                server_key: server_key.map(Into::into),
                timeout: timeout_ms.map(Duration::from_millis),
            };
            match client.get_with(key, options).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }
        Commands::Set {
            config,
            key,
            value,
            expire,
            server_key,
            timeout_ms,
        } => {
            let client = connect(&config)?;
            let options = SetOptions {
                expire,
                server_key: server_key.map(Into::into),
                timeout: timeout_ms.map(Duration::from_millis),
            };
            client.set_with(key, value, options).await?;
            println!("OK");
        }
        Commands::Mget {
            config,
            keys,
            timeout_ms,
        } => {
            let client = connect(&config)?;
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(client.options().default_timeout);
            run_mget(&client, &keys, timeout).await?;
        }
        Commands::Route { config, keys } => {
            route(config, keys)?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

/// Load the configuration, start logging and build a client from it
fn connect(config_path: &Path) -> Result<ShardedClient> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;

    info!(
        "redshard v{} with {} servers",
        env!("CARGO_PKG_VERSION"),
        config.servers.len()
    );
    debug!("Configuration loaded from: {:?}", config_path);

    ShardedClient::from_config(&config).context("Failed to build client")
}

async fn run_mget(client: &ShardedClient, keys: &[String], timeout: Duration) -> Result<()> {
    let (values, missing) = match client.mget_with_timeout(keys, timeout).await {
        Ok(values) => (values, Vec::new()),
        Err(RedshardError::PartialTimeout { resolved, missing }) => (resolved, missing),
        Err(e) => return Err(e.into()),
    };

    for key in keys {
        match values.get(key.as_bytes()) {
            Some(Some(value)) => println!("{}: {}", key, String::from_utf8_lossy(value)),
            Some(None) => println!("{}: (nil)", key),
            None => println!("{}: (timeout)", key),
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("{} of {} keys timed out", missing.len(), keys.len());
    }
    Ok(())
}

fn route(config_path: PathBuf, keys: Vec<String>) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let ring = config.build_ring()?;

    if keys.is_empty() {
        println!(
            "Ring: {} servers, {} points",
            ring.server_count(),
            ring.point_count()
        );
        for (ordinal, (address, weight, points)) in ring.distribution().into_iter().enumerate() {
            let share = points as f64 * 100.0 / ring.point_count() as f64;
            println!(
                "  {}: {} weight={} points={} ({:.1}%)",
                ordinal, address, weight, points, share
            );
        }
        return Ok(());
    }

    for key in &keys {
        let ordinal = ring.get_server_ordinal(key.as_bytes());
        println!("{} -> {} ({})", key, ring.server_for(key.as_bytes()), ordinal);
    }
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the server list to match your cluster and run:");
    println!("  redshard route --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!(
                "  Default timeout: {}ms, connect timeout: {}ms, retries: {}",
                config.client.default_timeout_ms,
                config.client.connect_timeout_ms,
                config.client.retry_count_on_connection_error
            );
            println!("  Servers: {} instances", config.servers.len());
            for (i, server) in config.servers.iter().enumerate() {
                println!("    {}: {} (weight {})", i, server.address, server.weight);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("redshard v{}", env!("CARGO_PKG_VERSION"));
    println!("A pipelining, ketama-sharded client for Redis-protocol key-value clusters");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • libketama-compatible consistent hashing with weights");
    println!("  • Pipelined batches multiplexed under one deadline");
    println!("  • Per-context connection pooling with retry on connection errors");
    println!("  • Sharded MGET with partial results on timeout");
}

fn init_logging(config: &Config) -> Result<()> {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
