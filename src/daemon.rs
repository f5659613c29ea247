//! The core event loop.
//!
//! One task owns the device registry, both subscriber sets, the compression
//! pipeline and the broker set; every mutation of those sets happens here.
//! Listeners, client readers/writers, device readers and broker event loops
//! run as separate tasks and communicate with the core through one
//! [`CoreEvent`] channel, which also serializes event delivery: lines from
//! one device reach all three sinks in arrival order, and a line is fully
//! dispatched before the next one is looked at.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::{self, Action, ClientFanout, ClientId, ClientKind};
use crate::compress::CompressPipeline;
use crate::config::Options;
use crate::mqtt::MqttBridge;
use crate::phy::backend::{DeviceBackend, FsBackend};
use crate::phy::{ControlError, PhyRegistry};
use crate::server;

/// Everything the auxiliary tasks report back to the core loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A listener accepted a subscriber connection.
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
        kind: ClientKind,
    },
    /// A complete command line arrived from a subscriber.
    ClientLine { id: ClientId, line: String },
    /// A subscriber connection ended (read or write side).
    ClientClosed { id: ClientId },
    /// A complete line arrived on a device's event stream.
    PhyLine { phy: String, line: String },
    /// A device's event stream ended or failed.
    PhyHangup { phy: String },
    /// A broker connection was established.
    BrokerUp { index: usize },
    /// A broker connection was lost.
    BrokerDown { index: usize },
}

pub struct Daemon {
    opts: Options,
    registry: PhyRegistry,
    fanout: ClientFanout,
    pipeline: Option<CompressPipeline>,
    bridge: MqttBridge,
    events_tx: mpsc::Sender<CoreEvent>,
    events_rx: mpsc::Receiver<CoreEvent>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(opts: Options, cancel: CancellationToken) -> Self {
        let backend = Arc::new(FsBackend::new(&opts.device_root));
        Self::with_backend(opts, backend, cancel)
    }

    pub fn with_backend(
        opts: Options,
        backend: Arc<dyn DeviceBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);

        // a broken pipeline disables the compressed channel, nothing else
        let pipeline = opts.zstd.as_ref().and_then(|z| match CompressPipeline::new(z) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("could not initialize compression: {e}");
                None
            }
        });

        let registry = PhyRegistry::new(backend, events_tx.clone(), cancel.clone());
        let bridge = MqttBridge::new(opts.brokers.clone());

        Self {
            opts,
            registry,
            fanout: ClientFanout::new(),
            pipeline,
            bridge,
            events_tx,
            events_rx,
            cancel,
        }
    }

    /// Runs until cancelled. The first device scan happens immediately, then
    /// on the configured interval.
    pub async fn run(mut self) {
        server::spawn_listeners(
            &self.opts.listen,
            self.opts.port,
            self.pipeline.is_some(),
            &self.events_tx,
            &self.cancel,
        );
        self.bridge.start(self.events_tx.clone());

        let mut scan = tokio::time::interval(Duration::from_millis(self.opts.scan_interval_ms));
        info!("ready to accept connections");

        loop {
            let flush_at = self.pipeline.as_ref().and_then(CompressPipeline::deadline);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = scan.tick() => self.run_scan(),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = idle_flush(flush_at) => self.flush_compressed(),
            }
        }

        self.shutdown();
    }

    fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Accepted { stream, peer, kind } => {
                let (read, write) = stream.into_split();
                let id = self.fanout.accept(
                    read,
                    write,
                    kind,
                    self.events_tx.clone(),
                    self.cancel.child_token(),
                );
                info!("client {id:?} is {peer}");
                self.replay_client(id);
            }
            CoreEvent::ClientLine { id, line } => self.handle_client_line(id, &line),
            CoreEvent::ClientClosed { id } => {
                self.fanout.remove(id);
            }
            CoreEvent::PhyLine { phy, line } => self.handle_phy_line(&phy, &line),
            CoreEvent::PhyHangup { phy } => {
                if self.registry.teardown(&phy) {
                    self.announce_removed(&phy);
                }
            }
            CoreEvent::BrokerUp { index } => {
                let phys = self.dump_all();
                for publish in self.bridge.on_connected(index, &phys) {
                    self.bridge.send(index, publish);
                }
            }
            CoreEvent::BrokerDown { index } => self.bridge.on_disconnected(index),
        }
    }

    fn run_scan(&mut self) {
        let changes = self.registry.scan();
        for phy in &changes.added {
            self.announce_added(phy);
        }
        for phy in &changes.removed {
            self.announce_removed(phy);
        }
    }

    /// Initial replay towards one new subscriber: for every known device its
    /// dump followed by the presence record, in discovery order. The dump
    /// flag is set once the replay delivered at least one device; a client
    /// that connects before any device exists keeps it unset so the first
    /// live addition still carries a dump.
    fn replay_client(&mut self, id: ClientId) {
        let names = self.registry.names();
        for phy in &names {
            for line in self.registry.dump(phy) {
                self.send_record(id, &client::dump_record(&line));
            }
            self.send_record(id, &client::presence_record(phy, true));
        }
        if !names.is_empty() {
            self.fanout.mark_dumped(id);
        }
    }

    /// Fans one device event line out to all three sinks.
    fn handle_phy_line(&mut self, phy: &str, line: &str) {
        // lines can still be queued from a reader whose device is gone
        if !self.registry.contains(phy) {
            return;
        }

        let record = client::event_record(phy, line);
        self.fanout
            .broadcast(ClientKind::Plain, Bytes::from(record.clone()));

        if let Some(pipeline) = self.pipeline.as_mut() {
            let fanout = &self.fanout;
            let observed = fanout.has_clients(ClientKind::Compressed);
            pipeline.ingest(&record, observed, |chunk| {
                fanout.broadcast(ClientKind::Compressed, chunk);
            });
        }

        self.bridge.publish_event(phy, line);
    }

    fn handle_client_line(&mut self, id: ClientId, line: &str) {
        if let Err(e) = self.dispatch_command(id, line) {
            let record = client::error_record(&e.to_string());
            self.send_record(id, &record);
        }
    }

    fn dispatch_command(&mut self, id: ClientId, line: &str) -> Result<(), ControlError> {
        let command = client::parse_command(line)?;
        match command.action {
            Action::Control(payload) => self.registry.control(&command.phy, &payload),
            Action::Debugfs { file, value } => {
                let content = self
                    .registry
                    .debug_access(&command.phy, &file, value.as_deref())?;
                if let Some(content) = content {
                    let record = client::debugfs_record(&command.phy, &file, &content);
                    self.send_record(id, &record);
                }
                Ok(())
            }
        }
    }

    fn announce_added(&mut self, phy: &str) {
        let dump = self.registry.dump(phy);

        for kind in [ClientKind::Plain, ClientKind::Compressed] {
            for id in self.fanout.ids_of(kind) {
                if self.fanout.dump_pending(id) {
                    for line in &dump {
                        self.send_record(id, &client::dump_record(line));
                    }
                    self.fanout.mark_dumped(id);
                }
                self.send_record(id, &client::presence_record(phy, true));
            }
        }

        self.bridge.publish_added(phy, &dump);
    }

    fn announce_removed(&mut self, phy: &str) {
        let record = client::presence_record(phy, false);
        self.fanout
            .broadcast(ClientKind::Plain, Bytes::from(record.clone()));
        for id in self.fanout.ids_of(ClientKind::Compressed) {
            self.send_record(id, &record);
        }
        self.bridge.publish_presence(phy, false);
    }

    /// Sends one control record to a subscriber, compressed as a single
    /// frame on the compressed channel so replay latency stays bounded.
    fn send_record(&mut self, id: ClientId, record: &str) {
        match self.fanout.kind_of(id) {
            Some(ClientKind::Plain) => {
                self.fanout.send(id, Bytes::from(record.to_owned()));
            }
            Some(ClientKind::Compressed) => {
                let Some(pipeline) = self.pipeline.as_mut() else {
                    return;
                };
                match pipeline.compress_frame(record) {
                    Ok(frame) => self.fanout.send(id, frame),
                    Err(e) => error!("dropping control record: {e}"),
                }
            }
            None => {}
        }
    }

    fn flush_compressed(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            let fanout = &self.fanout;
            pipeline.flush(&mut |chunk| {
                fanout.broadcast(ClientKind::Compressed, chunk);
            });
        }
    }

    fn dump_all(&self) -> Vec<(String, Vec<String>)> {
        self.registry
            .names()
            .into_iter()
            .map(|name| {
                let dump = self.registry.dump(&name);
                (name, dump)
            })
            .collect()
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        self.flush_compressed();
        self.bridge.shutdown();
    }
}

async fn idle_flush(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
