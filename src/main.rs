//! EmberKV server binary.
//!
//! Wires the pieces together: configuration from the command line, the
//! storage engine, the background active-expire sweeper, and the TCP
//! accept loop.

use emberkv::commands::CommandHandler;
use emberkv::connection::{handle_connection, ConnectionStats};
use emberkv::storage::{start_expiry_sweeper, EngineConfig, StorageEngine};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

struct Config {
    host: String,
    port: u16,
    engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: emberkv::DEFAULT_HOST.to_string(),
            port: emberkv::DEFAULT_PORT,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let take_value = |i: usize| {
                args.get(i + 1).cloned().unwrap_or_else(|| {
                    eprintln!("Error: {} requires a value", args[i]);
                    std::process::exit(1);
                })
            };
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = take_value(i);
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = take_value(i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--hash-max-listpack-entries" => {
                    config.engine.hash_max_listpack_entries =
                        take_value(i).parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid entry count");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--hash-max-listpack-value" => {
                    config.engine.hash_max_listpack_value =
                        take_value(i).parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid value length");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--active-expire-quota" => {
                    config.engine.active_expire_quota_per_cycle =
                        take_value(i).parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid quota");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--lazy-expire-disabled" => {
                    config.engine.lazy_expire_disabled = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("EmberKV version {}", emberkv::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }
        config
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
EmberKV - In-Memory Key-Value Store with Per-Field Hash TTLs

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>                  Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>                  Port to listen on (default: 6379)
        --hash-max-listpack-entries N  Compact-hash entry bound (default: 128)
        --hash-max-listpack-value N    Compact-hash value-length bound (default: 64)
        --active-expire-quota N        Field deletions per sweep cycle (default: 1000)
        --lazy-expire-disabled         Reads never delete expired fields
    -v, --version                      Print version information
        --help                         Print this help message

CONNECTING:
    Any Redis client works:
    $ redis-cli -p 6379
    127.0.0.1:6379> HSET user:1 session abc name ember
    (integer) 2
    127.0.0.1:6379> HEXPIRE user:1 60 FIELDS 1 session
    1) (integer) 1
    127.0.0.1:6379> HTTL user:1 FIELDS 2 session name
    1) (integer) 60
    2) (integer) -1
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("EmberKV v{} starting", emberkv::VERSION);

    let engine = Arc::new(StorageEngine::with_config(config.engine.clone()));
    let _sweeper = start_expiry_sweeper(Arc::clone(&engine));
    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("listening on {}", config.bind_address());

    let shutdown = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("shutdown signal received, stopping server");
    };

    tokio::select! {
        _ = accept_loop(listener, engine, stats) => {}
        _ = shutdown => {}
    }

    info!("server shutdown complete");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    engine: Arc<StorageEngine>,
    stats: Arc<ConnectionStats>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let commands = CommandHandler::new(Arc::clone(&engine));
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    handle_connection(stream, addr, commands, stats).await;
                });
            }
            Err(e) => error!("failed to accept connection: {e}"),
        }
    }
}
