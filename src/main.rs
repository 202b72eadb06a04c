//! SocksRtc - SOCKS5 over a negotiated peer transport
//!
//! This is the main entry point for the SocksRtc application. Signaling
//! batches for the other half are printed on stdout, one per line; batches
//! from the other half are read from stdin.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use socksrtc::config::{load_config, Config};
use socksrtc::connection::HandlerQueue;
use socksrtc::peer::PeerRole;
use socksrtc::proxy::{create_transport, RtcToNet, SocksToRtc};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Which half of the proxy to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Accept SOCKS5 clients and offer the peer transport
    Socks,
    /// Answer the peer transport and connect to destinations
    Net,
}

/// SocksRtc - SOCKS5 proxy relayed over a peer-to-peer transport
#[derive(Parser, Debug)]
#[command(name = "socksrtc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy half to run
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

/// Either proxy half behind one interface
#[derive(Clone)]
enum Proxy {
    Socks(SocksToRtc),
    Net(RtcToNet),
}

impl Proxy {
    async fn start(&self) -> Result<()> {
        match self {
            Proxy::Socks(socks) => socks.start().await.map(|endpoint| {
                info!("SOCKS5 server listening on {}", endpoint);
            }),
            Proxy::Net(net) => net.start().await,
        }
    }

    async fn stop(&self) -> Result<()> {
        match self {
            Proxy::Socks(socks) => socks.stop().await,
            Proxy::Net(net) => net.stop().await,
        }
    }

    async fn once_stopped(&self) {
        match self {
            Proxy::Socks(socks) => socks.once_stopped().await,
            Proxy::Net(net) => net.once_stopped().await,
        }
    }

    fn signals_for_peer(&self) -> &HandlerQueue<String> {
        match self {
            Proxy::Socks(socks) => socks.signals_for_peer(),
            Proxy::Net(net) => net.signals_for_peer(),
        }
    }

    fn handle_signal_from_peer(&self, batch: &str) {
        let result = match self {
            Proxy::Socks(socks) => socks.handle_signal_from_peer(batch),
            Proxy::Net(net) => net.handle_signal_from_peer(batch),
        };
        match result {
            Ok(count) => info!("Accepted {} signaling messages", count),
            Err(e) => warn!("Ignoring signaling input: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            config
        }
        None => Config::default(),
    };

    info!("SocksRtc v{}", socksrtc::VERSION);

    let role = match args.mode {
        Mode::Socks => PeerRole::Offerer,
        Mode::Net => PeerRole::Answerer,
    };
    let transport = create_transport(role, &config).await?;
    let proxy = match args.mode {
        Mode::Socks => Proxy::Socks(SocksToRtc::new(&config, transport)?),
        Mode::Net => Proxy::Net(RtcToNet::new(&config, transport)?),
    };

    // Handlers run under the queue lock; stdout is written from its own task
    let (batches_tx, mut batches_rx) = mpsc::unbounded_channel::<String>();
    proxy.signals_for_peer().set_handler(move |batch: String| {
        let _ = batches_tx.send(batch);
    });
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(batch) = batches_rx.recv().await {
            let line = format!("{}\n", batch);
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                error!("Failed to write signaling batch to stdout");
            }
        }
    });

    // Feed signaling from stdin
    let reader = proxy.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => reader.handle_signal_from_peer(line.trim()),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    // Handle Ctrl+C and termination signals (cross-platform)
    let stopper = proxy.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        if let Err(e) = stopper.stop().await {
            error!("Shutdown failed: {:#}", e);
        }
    });

    if let Err(e) = proxy.start().await {
        error!("Failed to start: {:#}", e);
        return Err(e);
    }

    proxy.once_stopped().await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries signaling, so logs go to stderr
    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
