//! peerdrop - Send one file straight to another machine.
//!
//! The host prints a six-character code; the joiner types it in and the
//! file moves over a direct TCP connection. Both sides must see the same
//! signal directory (a shared or synced folder, or the same machine).
//!
//! ## Trying it on one machine
//!
//! ```bash
//! # Terminal 1
//! PEERDROP_SIGNAL_DIR=/tmp/peerdrop cargo run -- host ./photo.jpg
//!
//! # Terminal 2
//! PEERDROP_SIGNAL_DIR=/tmp/peerdrop cargo run -- join K7Q2ZD --out /tmp/inbox
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use peerdrop::net::signaling::SIGNAL_DIR_ENV;
use peerdrop::net::{
    ConnectionNegotiator, DirSignalingStore, NegotiatorConfig, OutgoingFile, ReceivedFile,
    TcpConfig, TransferEngine, TransferProgress,
};

/// How long the host waits for the joiner to hang up after the last chunk
const LINGER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "peerdrop", version, about = "Direct peer-to-peer file drops")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Directory shared by both peers for the offer/answer exchange
    #[arg(long, global = true, env = SIGNAL_DIR_ENV)]
    signal_dir: Option<PathBuf>,

    /// Seconds to wait for the other side during negotiation
    #[arg(long, global = true, default_value_t = 60)]
    timeout: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Share a file and print the session code
    Host {
        /// File to send
        file: PathBuf,

        /// Address to listen on for the joiner
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
    /// Receive a file using a session code
    Join {
        /// Code printed by the host
        code: String,

        /// Directory to save the file into (defaults to Downloads)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // Cancellation token for Ctrl-C
    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel_token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let signal_dir = cli
        .common
        .signal_dir
        .clone()
        .unwrap_or_else(DirSignalingStore::default_dir);
    let store = DirSignalingStore::open(&signal_dir)
        .await
        .with_context(|| format!("failed to open signal directory {}", signal_dir.display()))?;
    debug!(signal_dir = %signal_dir.display(), "Signal directory ready");

    let config = NegotiatorConfig {
        timeout: Duration::from_secs(cli.common.timeout),
        ..NegotiatorConfig::default()
    };

    match cli.command {
        Command::Host { file, bind } => {
            let factory = TcpConfig {
                bind_addr: bind,
                ..TcpConfig::default()
            };
            let negotiator = ConnectionNegotiator::with_config(store, factory, config);
            run_host(&negotiator, file, &cancel_token).await
        }
        Command::Join { code, out } => {
            let out_dir = out.unwrap_or_else(default_download_dir);
            let negotiator = ConnectionNegotiator::with_config(store, TcpConfig::default(), config);
            run_join(&negotiator, &code, out_dir, &cancel_token).await
        }
    }
}

/// Publish an offer, wait for the joiner and send the file.
async fn run_host(
    negotiator: &ConnectionNegotiator<DirSignalingStore, TcpConfig>,
    path: PathBuf,
    cancel: &CancellationToken,
) -> Result<()> {
    let file = OutgoingFile::from_path(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let code = negotiator
        .create_connection()
        .await
        .context("failed to publish offer")?;
    println!("Session code: {code}");
    info!(name = %file.name, size = file.size(), "Waiting for the joiner");

    let result = tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(anyhow::anyhow!("interrupted")),
        result = host_transfer(negotiator, file) => result,
    };

    negotiator.teardown().await;
    result
}

async fn host_transfer(
    negotiator: &ConnectionNegotiator<DirSignalingStore, TcpConfig>,
    file: OutgoingFile,
) -> Result<()> {
    let session = negotiator
        .complete_connection()
        .await
        .context("negotiation failed")?;
    session.wait_open().await.context("connection did not open")?;
    info!("Connected to joiner");

    let engine = TransferEngine::new(session);
    let mut logged = ProgressLog::default();
    let progress = engine
        .send_file(file, |p| logged.record(&p))
        .await
        .context("transfer failed")?;
    println!(
        "Sent {} bytes in {} chunks",
        progress.sent_bytes, progress.total_chunks
    );

    // Frames may still be queued; the joiner hangs up once it has the file
    if tokio::time::timeout(LINGER_TIMEOUT, engine.session().closed())
        .await
        .is_err()
    {
        warn!("Joiner did not disconnect, closing");
    }
    engine.close();
    Ok(())
}

/// Answer the host's offer and save the first file received.
async fn run_join(
    negotiator: &ConnectionNegotiator<DirSignalingStore, TcpConfig>,
    code: &str,
    out_dir: PathBuf,
    cancel: &CancellationToken,
) -> Result<()> {
    let session = negotiator
        .join_connection(code)
        .await
        .context("failed to join session")?;

    let open_timeout = negotiator.config().timeout;
    tokio::select! {
        biased;

        _ = cancel.cancelled() => bail!("interrupted"),
        opened = tokio::time::timeout(open_timeout, session.wait_open()) => {
            opened
                .context("host did not accept the connection in time")?
                .context("connection did not open")?;
        }
    }
    info!("Connected to host");

    let engine = TransferEngine::new(session);
    let (file_tx, mut file_rx) = mpsc::channel(1);
    // Zero-byte files never produce a received event
    engine.on_file_announced({
        let file_tx = file_tx.clone();
        move |metadata| {
            println!(
                "Incoming {} ({} bytes, {})",
                metadata.name, metadata.size, metadata.media_type
            );
            if metadata.size == 0 && file_tx.try_send(ReceivedFile::empty(&metadata)).is_err() {
                debug!("Ignoring extra file");
            }
        }
    });
    engine.on_file_received(move |file| {
        if file_tx.try_send(file).is_err() {
            debug!("Ignoring extra file");
        }
    });

    let file = tokio::select! {
        biased;

        _ = cancel.cancelled() => None,
        file = file_rx.recv() => file,
        _ = engine.session().closed() => None,
    };
    let Some(file) = file else {
        engine.close();
        negotiator.teardown().await;
        bail!("connection ended before a file arrived");
    };

    let saved = file.save_into(&out_dir).await;
    engine.close();
    negotiator.teardown().await;

    let path = saved.with_context(|| format!("failed to save into {}", out_dir.display()))?;
    println!("Received {} ({} bytes) -> {}", file.name, file.size(), path.display());
    Ok(())
}

/// Logs send progress at every tenth of the file.
#[derive(Debug, Default)]
struct ProgressLog {
    last_decile: Option<u32>,
}

impl ProgressLog {
    fn record(&mut self, progress: &TransferProgress) {
        let decile = (progress.percent() / 10.0) as u32;
        if self.last_decile != Some(decile) {
            self.last_decile = Some(decile);
            info!(
                percent = progress.percent().round(),
                sent = progress.sent_bytes,
                total = progress.total_bytes,
                "Sending"
            );
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Initialize logging with tracing.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peerdrop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
