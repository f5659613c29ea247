pub mod client;
pub mod compress;
pub mod config;
pub mod daemon;
pub mod mqtt;
pub mod phy;
pub mod server;

use clap::Parser;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{Args, Options};
use crate::daemon::Daemon;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    let args = Args::parse();
    let opts = Options::load(&args)?;
    info!(
        "starting with {} bind address(es), {} broker(s), compression {}",
        opts.listen.len(),
        opts.brokers.len(),
        if opts.zstd.is_some() { "on" } else { "off" },
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    Daemon::new(opts, cancel).run().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// SIGINT/SIGTERM trigger one coordinated shutdown through the shared
/// cancellation token; the daemon handles the ordered teardown itself.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGINT handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        info!("stop signal received");
        cancel.cancel();
    });
}
