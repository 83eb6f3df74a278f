//! Entry point for `timer-server`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, signal handling, argument parsing).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use timer_server::codec::DEFAULT_MAX_COOKIE_SIZE;
use timer_server::config::{DEFAULT_PORT, MAX_CONNECTIONS, MAX_TIMERS};
use timer_server::{Client, Clock, Server, ServerConfig, SessionConfig, SystemClock};

/// Holds requests until their Unix due time, then echoes the cookie back.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the timer server.
    Server {
        /// Port to listen on.
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Local address to bind.
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        /// Concurrent connections admitted before accepts pause.
        #[arg(long, default_value_t = MAX_CONNECTIONS)]
        max_connections: usize,
        /// Pending requests allowed per connection.
        #[arg(long, default_value_t = MAX_TIMERS)]
        max_timers: usize,
        /// Largest cookie accepted, in bytes.
        #[arg(long, default_value_t = DEFAULT_MAX_COOKIE_SIZE)]
        max_cookie_size: u32,
        /// Seconds a partially received frame may take to complete.
        #[arg(long, default_value_t = 30)]
        frame_timeout: u64,
    },
    /// Send wake-up requests to a running server and print the replies.
    Client {
        /// Server address.
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,
        /// Server port.
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Number of requests to send on the connection.
        #[arg(short, long, default_value_t = 1)]
        messages: u32,
        /// Seconds from now until the requests are due.
        #[arg(short, long, default_value_t = 5)]
        delay: u64,
        /// Cookie sent with every request.
        #[arg(short, long, default_value = "Wake me up, before i go go")]
        cookie: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            port,
            host,
            max_connections,
            max_timers,
            max_cookie_size,
            frame_timeout,
        } => {
            let config = ServerConfig {
                bind: SocketAddr::new(host, port),
                max_connections,
                session: SessionConfig {
                    max_timers,
                    max_cookie_size,
                    frame_timeout: Duration::from_secs(frame_timeout),
                    ..SessionConfig::default()
                },
            };
            run_server(config).await
        }
        Mode::Client {
            server,
            port,
            messages,
            delay,
            cookie,
        } => run_client(&server, port, messages, delay, cookie).await,
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Server::bind(config).await.context("starting server")?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Ctrl-C received, shutting down");
        })
        .await;
    Ok(())
}

async fn run_client(host: &str, port: u16, messages: u32, delay: u64, cookie: String) -> Result<()> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))?;

    log::info!("Connecting to {addr}");
    let mut client = Client::connect(addr).await?;

    let due_time = SystemClock.now().as_secs() + delay;
    for _ in 0..messages {
        let id = client.wake_at(due_time, cookie.clone().into_bytes()).await?;
        println!("Request {id} due at {due_time}: {cookie}");
    }

    let wait = Duration::from_secs(delay + 30);
    for _ in 0..messages {
        let resp = client.next_response(wait).await?;
        println!(
            "Timer up: request {} cookie {:?}",
            resp.id,
            String::from_utf8_lossy(&resp.cookie)
        );
    }

    client.close().await?;
    Ok(())
}
