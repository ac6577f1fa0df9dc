//! Serve the duck test over WebSocket, or ask a running server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::net::SocketAddr;

use clap::{Parser, Subcommand, ValueEnum};
use proven_duck_tester::{LIKE_A_DUCK, ROOT_TYPE, ask, ask_blocking, registry};
use proven_session_rpc::{BlockingConfig, ConnectionConfig, ServerConfig, Value, WireFormat};
use proven_session_rpc_ws::{WebSocketServer, connect, connect_blocking};
use serde_json::json;
use tokio::runtime::Runtime;
use tracing::{info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Runtime setup failed
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// RPC failure
    #[error(transparent)]
    Rpc(#[from] proven_session_rpc::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Wait on each call from the calling thread
    Blocking,
    /// Await each call on a tokio runtime
    Async,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Duck test over session RPC", long_about = None)]
struct Cli {
    /// Frame encoding; client and server must agree
    #[arg(long, global = true, default_value_t = WireFormat::Json, env = "DUCK_TESTER_FORMAT")]
    format: WireFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the DuckTester root type
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0", env = "DUCK_TESTER_HOST")]
        host: std::net::IpAddr,

        /// Port to listen on
        #[arg(short, long, default_value_t = 12345, env = "DUCK_TESTER_PORT")]
        port: u16,

        /// Maximum concurrent connections
        #[arg(long, default_value_t = 100, env = "DUCK_TESTER_MAX_CONNECTIONS")]
        max_connections: usize,
    },

    /// Ask a running server whether something is a duck
    Ask {
        /// Server URL
        #[arg(long, default_value = "ws://127.0.0.1:12345/", env = "DUCK_TESTER_URL")]
        url: String,

        /// Calling convention
        #[arg(long, value_enum, default_value_t = Mode::Blocking)]
        mode: Mode,

        /// How it looks
        #[arg(long, default_value = LIKE_A_DUCK)]
        looks: String,

        /// How it swims
        #[arg(long, default_value = LIKE_A_DUCK)]
        swims: String,

        /// How it quacks
        #[arg(long, default_value = LIKE_A_DUCK)]
        quacks: String,
    },
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let connection_config = ConnectionConfig::default().format(cli.format);

    match cli.command {
        Command::Serve {
            host,
            port,
            max_connections,
        } => {
            let config = ServerConfig::default()
                .max_connections(max_connections)
                .connection(connection_config);
            Runtime::new()?.block_on(run_server(SocketAddr::new(host, port), config))
        }
        Command::Ask {
            url,
            mode,
            looks,
            swims,
            quacks,
        } => {
            let obj = json!({ "looks": looks, "swims": swims, "quacks": quacks });
            let is_duck = match mode {
                Mode::Blocking => run_blocking(&url, &obj, connection_config)?,
                Mode::Async => Runtime::new()?.block_on(run_async(&url, &obj, connection_config))?,
            };
            println!(
                "It's probably {}a duck.",
                if is_duck { "" } else { "NOT " }
            );
            Ok(())
        }
    }
}

async fn run_server(addr: SocketAddr, config: ServerConfig) -> Result<(), Error> {
    let server = WebSocketServer::bind(addr, registry(), config).await?;
    info!("Serving {} at {}", ROOT_TYPE, server.url());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }

    info!("Shutting down");
    server.shutdown();
    server.wait().await?;
    Ok(())
}

fn run_blocking(url: &str, obj: &Value, config: ConnectionConfig) -> Result<bool, Error> {
    let mut connection = connect_blocking(url, BlockingConfig::default().connection(config))?;
    let session = connection.open_session(ROOT_TYPE, Value::Null)?;
    let is_duck = ask_blocking(&session, obj)?;
    session.close();
    connection.close();
    Ok(is_duck)
}

async fn run_async(url: &str, obj: &Value, config: ConnectionConfig) -> Result<bool, Error> {
    let connection = connect(url, config).await?;
    let session = connection.open_session(ROOT_TYPE, Value::Null).await?;
    let is_duck = ask(&session, obj).await?;
    session.close();
    connection.close().await;
    Ok(is_duck)
}
