//! Command-line interface for vrswatch
//!
//! Waits for one port row to be resolved and prints its record as JSON.
//!
//! ```bash
//! # Local VRS over TCP, give up after two minutes
//! vrswatch vm1-port0 --timeout-secs 120
//!
//! # Unix socket, keep retrying until the server comes up
//! RUST_LOG=vrswatch=debug vrswatch vm1-port0 \
//!   --endpoint unix:/var/run/openvswitch/db.sock --retry
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use vrswatch::transport::{Endpoint, JsonRpcConnector};
use vrswatch::{CancelToken, ConnectionManager, WatchConfig};

#[derive(Parser)]
#[command(name = "vrswatch")]
#[command(about = "Wait until an OVSDB port row has an address, gateway and mask")]
#[command(long_about = None)]
struct Cli {
    /// Name of the port row to wait for
    port: String,

    /// JSON config file; flags override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Server endpoint (tcp:HOST:PORT or unix:PATH)
    #[arg(long, env = "VRSWATCH_ENDPOINT")]
    endpoint: Option<Endpoint>,

    /// Database name
    #[arg(long)]
    database: Option<String>,

    /// Port table name
    #[arg(long)]
    table: Option<String>,

    /// Give up after this many seconds (0 waits forever)
    #[arg(long, default_value = "0")]
    timeout_secs: u64,

    /// Keep retrying the initial connection instead of failing fast
    #[arg(long)]
    retry: bool,
}

impl Cli {
    fn watch_config(&self) -> anyhow::Result<WatchConfig> {
        let mut config = match &self.config {
            Some(path) => WatchConfig::from_file(path)?,
            None => WatchConfig::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(table) = &self.table {
            config.table = table.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.watch_config()?;
    let endpoint = config.endpoint.clone();
    let connector = Arc::new(JsonRpcConnector::new(config.rpc_timeout()));

    let manager = if cli.retry {
        ConnectionManager::connect_with_retry(connector, config, &CancelToken::new())
    } else {
        ConnectionManager::connect(connector, config)
    }
    .with_context(|| format!("failed to connect to {endpoint}"))?;

    let watch = manager
        .wait_for_row_resolution(&cli.port)
        .with_context(|| format!("failed to watch port {}", cli.port))?;

    let record = if cli.timeout_secs == 0 {
        watch.recv()?
    } else {
        watch
            .recv_timeout(Duration::from_secs(cli.timeout_secs))
            .with_context(|| format!("port {} did not resolve", cli.port))?
    };

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
