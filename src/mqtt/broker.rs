//! Per-broker connection handling.
//!
//! Every broker gets its own event-loop task. The client identity is built
//! once, when the task is launched, and reused across reconnect attempts.
//! The event loop carries keepalive and protocol housekeeping; a poll error
//! is the "no connection" signal that requeues the broker, after which
//! polling again retries the connection on a fixed short interval.

use std::io;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::daemon::CoreEvent;
use crate::mqtt::BrokerConfig;

/// Keepalive interval maintained by the event loop.
pub const KEEPALIVE: Duration = Duration::from_secs(5);

/// Delay between reconnect attempts while a broker is pending.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Message published by the broker on our behalf on ungraceful disconnect.
const WILL_MESSAGE: &str = "disconnected";

/// Builds the client identity for one broker and spawns its connection
/// task. Returns the publish handle kept by the bridge.
pub fn launch(
    index: usize,
    cfg: &BrokerConfig,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) -> io::Result<AsyncClient> {
    let mut options = MqttOptions::new(cfg.id.clone(), cfg.addr.clone(), cfg.port);
    options.set_keep_alive(KEEPALIVE);
    options.set_last_will(LastWill::new(
        cfg.id.clone(),
        WILL_MESSAGE,
        QoS::AtMostOnce,
        false,
    ));

    if let Some(ca_path) = &cfg.ca_path {
        let ca = std::fs::read(ca_path)?;
        options.set_transport(Transport::Tls(rumqttc::TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    let id = cfg.id.clone();
    tokio::spawn(run(index, id, eventloop, events, cancel));
    Ok(client)
}

/// Drives one broker's event loop until shutdown, reporting connectivity
/// transitions to the core loop.
async fn run(
    index: usize,
    id: String,
    mut eventloop: EventLoop,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                // drain the graceful disconnect the bridge queued for us
                let _ =
                    tokio::time::timeout(Duration::from_millis(250), eventloop.poll()).await;
                return;
            }
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if events.send(CoreEvent::BrokerUp { index }).await.is_err() {
                    return;
                }
            }
            Ok(event) => debug!("{id}: {event:?}"),
            Err(e) => {
                warn!("{id}: connection error: {e}");
                if events.send(CoreEvent::BrokerDown { index }).await.is_err() {
                    return;
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}
