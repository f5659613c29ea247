//! Subscriber fan-out and the line-oriented client protocol.
//!
//! Records are `;`-separated fields terminated by `\n` (a preceding `\r` is
//! accepted and stripped on input):
//!
//! - presence: `<phy>;0;add` / `<phy>;0;remove`
//! - device event: `<phy>;<event line as received>`
//! - initial dump line: `*;0;<info line>`
//! - debug passthrough reply: `<phy>;0;debugfs;<file>;<comma-joined content>`
//! - global error: `*;0;#error;<message>`
//!
//! Inbound commands are `<phy>;<payload>`; a payload starting with
//! `debugfs;` is routed to the debug passthrough, anything else goes to the
//! device's control channel verbatim.
//!
//! Each subscriber owns its socket. Outbound data is queued to a per-client
//! writer task so one slow subscriber never stalls the core loop; a read or
//! write failure tears down only that client.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::daemon::CoreEvent;
use crate::phy::ControlError;

/// Stable identifier of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// Which listening channel the subscriber connected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Plain,
    Compressed,
}

/// A parsed inbound command line.
#[derive(Debug, PartialEq, Eq)]
pub struct Command {
    pub phy: String,
    pub action: Action,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Forward the payload to the device's control channel.
    Control(String),
    /// Constrained debug-file read or write.
    Debugfs { file: String, value: Option<String> },
}

/// Parses `<phy>;<payload>` into a [`Command`].
pub fn parse_command(line: &str) -> Result<Command, ControlError> {
    let (phy, payload) = line.split_once(';').ok_or(ControlError::Syntax)?;

    if let Some(rest) = payload.strip_prefix("debugfs;") {
        let mut fields = rest.split(';');
        let file = fields.next().unwrap_or_default().to_owned();
        let value = fields.next().map(str::to_owned);
        return Ok(Command {
            phy: phy.to_owned(),
            action: Action::Debugfs { file, value },
        });
    }

    Ok(Command {
        phy: phy.to_owned(),
        action: Action::Control(payload.to_owned()),
    })
}

pub fn presence_record(phy: &str, added: bool) -> String {
    format!("{phy};0;{}\n", if added { "add" } else { "remove" })
}

pub fn event_record(phy: &str, line: &str) -> String {
    format!("{phy};{line}\n")
}

pub fn dump_record(line: &str) -> String {
    format!("*;0;{line}\n")
}

pub fn error_record(message: &str) -> String {
    format!("*;0;#error;{message}\n")
}

pub fn debugfs_record(phy: &str, file: &str, content: &str) -> String {
    format!("{phy};0;debugfs;{file};{content}\n")
}

struct Client {
    id: ClientId,
    kind: ClientKind,
    outbound: mpsc::UnboundedSender<Bytes>,
    init_done: bool,
}

/// Owns both subscriber sets. Mutated only from the core loop.
pub struct ClientFanout {
    clients: Vec<Client>,
    next_id: u64,
}

impl ClientFanout {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            next_id: 0,
        }
    }

    /// Registers a new subscriber and spawns its reader and writer tasks.
    /// The connection is owned by the tasks; the fan-out only keeps the
    /// outbound queue handle.
    pub fn accept<R, W>(
        &mut self,
        read: R,
        write: W,
        kind: ClientKind,
        events: mpsc::Sender<CoreEvent>,
        cancel: CancellationToken,
    ) -> ClientId
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = ClientId(self.next_id);
        self.next_id += 1;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_client_writer(id, write, outbound_rx, events.clone()));
        tokio::spawn(run_client_reader(id, read, events, cancel));

        info!("client {id:?} connected ({kind:?})");
        self.clients.push(Client {
            id,
            kind,
            outbound,
            init_done: false,
        });
        id
    }

    /// Drops a subscriber; its writer task exits once the queue closes,
    /// which releases the connection. Safe to call twice (reader and writer
    /// both report closure).
    pub fn remove(&mut self, id: ClientId) -> bool {
        let Some(idx) = self.clients.iter().position(|c| c.id == id) else {
            return false;
        };
        let client = self.clients.remove(idx);
        info!("client {id:?} disconnected ({:?})", client.kind);
        true
    }

    pub fn kind_of(&self, id: ClientId) -> Option<ClientKind> {
        self.clients.iter().find(|c| c.id == id).map(|c| c.kind)
    }

    pub fn dump_pending(&self, id: ClientId) -> bool {
        self.clients
            .iter()
            .find(|c| c.id == id)
            .is_some_and(|c| !c.init_done)
    }

    pub fn mark_dumped(&mut self, id: ClientId) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.id == id) {
            client.init_done = true;
        }
    }

    /// Snapshot of one subscriber set, used when announcing to everyone.
    pub fn ids_of(&self, kind: ClientKind) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.id)
            .collect()
    }

    pub fn has_clients(&self, kind: ClientKind) -> bool {
        self.clients.iter().any(|c| c.kind == kind)
    }

    /// Queues bytes to one subscriber. A closed queue is ignored; the
    /// writer task already reported the closure.
    pub fn send(&self, id: ClientId, data: Bytes) {
        if let Some(client) = self.clients.iter().find(|c| c.id == id) {
            let _ = client.outbound.send(data);
        }
    }

    /// Queues the same bytes to every subscriber of one kind.
    pub fn broadcast(&self, kind: ClientKind, data: Bytes) {
        for client in self.clients.iter().filter(|c| c.kind == kind) {
            let _ = client.outbound.send(data.clone());
        }
    }
}

async fn run_client_writer<W>(
    id: ClientId,
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<CoreEvent>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(data) = outbound.recv().await {
        if let Err(e) = write.write_all(&data).await {
            debug!("client {id:?} write failed: {e}");
            let _ = events.send(CoreEvent::ClientClosed { id }).await;
            return;
        }
    }
    // queue closed: the client was removed, let the connection drop
    let _ = write.shutdown().await;
}

async fn run_client_reader<R>(
    id: ClientId,
    read: R,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            // EOF; an unterminated trailing fragment is not a command
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    break;
                }
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if events
                    .send(CoreEvent::ClientLine { id, line })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                debug!("client {id:?} read failed: {e}");
                break;
            }
        }
    }

    let _ = events.send(CoreEvent::ClientClosed { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_commands_verbatim() {
        let cmd = parse_command("phy0;rates;aa;bb;cc").unwrap();
        assert_eq!(cmd.phy, "phy0");
        assert_eq!(cmd.action, Action::Control("rates;aa;bb;cc".to_owned()));
    }

    #[test]
    fn parses_debugfs_read_and_write() {
        let read = parse_command("phy0;debugfs;stations").unwrap();
        assert_eq!(
            read.action,
            Action::Debugfs {
                file: "stations".to_owned(),
                value: None,
            }
        );

        let write = parse_command("phy0;debugfs;ampdu;1").unwrap();
        assert_eq!(
            write.action,
            Action::Debugfs {
                file: "ampdu".to_owned(),
                value: Some("1".to_owned()),
            }
        );
    }

    #[test]
    fn command_without_separator_is_a_syntax_error() {
        let err = parse_command("justonefield").unwrap_err();
        assert_eq!(err.to_string(), "Syntax error");
    }

    #[test]
    fn record_formats() {
        assert_eq!(presence_record("phy0", true), "phy0;0;add\n");
        assert_eq!(presence_record("phy0", false), "phy0;0;remove\n");
        assert_eq!(event_record("phy0", "100;txs;a,b"), "phy0;100;txs;a,b\n");
        assert_eq!(dump_record("#version;1"), "*;0;#version;1\n");
        assert_eq!(
            error_record("PHY not found"),
            "*;0;#error;PHY not found\n"
        );
        assert_eq!(
            debugfs_record("phy0", "stations", "a,b"),
            "phy0;0;debugfs;stations;a,b\n"
        );
    }

    #[tokio::test]
    async fn reader_strips_carriage_returns_and_reports_eof() {
        let (mut tx_io, rx_io) = tokio::io::duplex(256);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut fanout = ClientFanout::new();
        let (_out, sink) = tokio::io::duplex(256);

        let id = fanout.accept(
            rx_io,
            sink,
            ClientKind::Plain,
            events_tx,
            CancellationToken::new(),
        );

        tx_io.write_all(b"phy0;rates;ff\r\n").await.unwrap();
        drop(tx_io);

        match events_rx.recv().await {
            Some(CoreEvent::ClientLine { id: got, line }) => {
                assert_eq!(got, id);
                assert_eq!(line, "phy0;rates;ff");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events_rx.recv().await,
            Some(CoreEvent::ClientClosed { .. })
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_only_matching_kind() {
        use tokio::io::AsyncReadExt;

        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut fanout = ClientFanout::new();
        let cancel = CancellationToken::new();

        let (_plain_tx, plain_rx) = tokio::io::duplex(256);
        let (plain_sink_w, mut plain_peer) = tokio::io::duplex(256);
        fanout.accept(
            plain_rx,
            plain_sink_w,
            ClientKind::Plain,
            events_tx.clone(),
            cancel.clone(),
        );

        let (_z_tx, z_rx) = tokio::io::duplex(256);
        let (z_sink_w, mut z_peer) = tokio::io::duplex(256);
        fanout.accept(z_rx, z_sink_w, ClientKind::Compressed, events_tx, cancel);

        fanout.broadcast(ClientKind::Plain, Bytes::from_static(b"phy0;0;add\n"));

        let mut buf = vec![0u8; 16];
        let n = plain_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"phy0;0;add\n");

        // nothing may reach the compressed client
        let timeout =
            tokio::time::timeout(std::time::Duration::from_millis(50), z_peer.read(&mut buf));
        assert!(timeout.await.is_err());
    }
}
