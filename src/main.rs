use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use catalog_stream::config::Config;
use catalog_stream::server;
use catalog_stream::streaming::{BodySink, FlushPolicy, StreamFormat, StreamPump};

#[derive(Parser, Debug)]
#[command(
    name = "catalog-stream",
    version,
    about = "Stream catalog listings as JSON, NDJSON or MessagePack"
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CATALOG_STREAM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Format used when Accept names none of the streamed types
    #[arg(long, env = "CATALOG_STREAM_DEFAULT_FORMAT", global = true)]
    default_format: Option<StreamFormat>,

    /// Records between forced flushes
    #[arg(long, env = "CATALOG_STREAM_FLUSH_EVERY", global = true)]
    flush_every: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `GET /items` over HTTP/1.1
    Serve {
        /// Listen address (default 127.0.0.1:8080)
        #[arg(short, long, env = "CATALOG_STREAM_LISTEN")]
        listen: Option<SocketAddr>,

        /// Records per listing (unbounded if unset)
        #[arg(short, long)]
        records: Option<u64>,
    },

    /// Write a listing body to stdout
    Dump {
        /// Body format
        #[arg(short, long, default_value = "ndjson")]
        format: StreamFormat,

        /// Number of records
        #[arg(short = 'n', long, default_value_t = 10)]
        records: u64,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "catalog_stream=info",
        1 => "catalog_stream=debug",
        _ => "catalog_stream=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(format) = cli.default_format {
        config.stream.default_format = format;
    }
    if let Some(every) = cli.flush_every {
        config.stream.flush_every = FlushPolicy::new(every)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(&cli)?;
    debug!(?config, "loaded configuration");

    match cli.command {
        Command::Serve { listen, records } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if records.is_some() {
                config.server.records = records;
            }

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received Ctrl-C, shutting down");
                    signal.cancel();
                }
            });

            server::serve(&config.server, config.stream, shutdown).await
        }
        Command::Dump { format, records } => {
            let pump = StreamPump::new(format, config.stream.flush_every);
            let mut sink = BodySink::new(tokio::io::stdout());
            let outcome = pump
                .run(
                    server::catalog_items(Some(records)),
                    &mut sink,
                    &CancellationToken::new(),
                )
                .await
                .context("Failed to write listing")?;
            debug!(records = outcome.records, bytes = outcome.bytes, "dump finished");
            Ok(())
        }
    }
}
