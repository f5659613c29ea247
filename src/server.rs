//! TCP listeners for subscriber connections.
//!
//! Every configured bind address gets a plain listener and, when the
//! compressed channel is enabled, a second listener on the next port.
//! Accepted connections are handed to the core loop; the listeners know
//! nothing about the protocol.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::ClientKind;
use crate::daemon::CoreEvent;

/// Default port of the plain channel; the compressed channel listens one
/// port above.
pub const DEFAULT_PORT: u16 = 0x5243;

/// Delay before a failed bind is retried.
const REBIND_DELAY: Duration = Duration::from_millis(1000);

/// Spawns accept loops for every bind address and enabled channel.
pub fn spawn_listeners(
    addrs: &[String],
    port: u16,
    compressed: bool,
    events: &mpsc::Sender<CoreEvent>,
    cancel: &CancellationToken,
) {
    for addr in addrs {
        tokio::spawn(accept_loop(
            addr.clone(),
            port,
            ClientKind::Plain,
            events.clone(),
            cancel.clone(),
        ));
        if compressed {
            tokio::spawn(accept_loop(
                addr.clone(),
                port + 1,
                ClientKind::Compressed,
                events.clone(),
                cancel.clone(),
            ));
        }
    }
}

/// Binds and accepts until shutdown. A failed bind or a fatal accept error
/// tears the socket down and rebinds after a short delay, so a transient
/// address problem never kills the channel.
async fn accept_loop(
    addr: String,
    port: u16,
    kind: ClientKind,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) {
    loop {
        let listener = tokio::select! {
            _ = cancel.cancelled() => return,
            bound = TcpListener::bind((addr.as_str(), port)) => match bound {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("failed to open server port {port} on {addr}: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(REBIND_DELAY) => continue,
                    }
                }
            },
        };
        info!("listening on {addr}:{port} ({kind:?})");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let event = CoreEvent::Accepted { stream, peer, kind };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // per-connection errors are transient; anything else
                    // warrants a fresh socket
                    error!("accept on {addr}:{port} failed: {e}");
                    break;
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REBIND_DELAY) => {}
        }
    }
}
