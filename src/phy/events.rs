//! Per-device event stream reader.
//!
//! Drains the device's event file in fixed-size reads, splits the bytes on
//! line boundaries and forwards each complete line to the core loop. A
//! partial trailing line is carried over and prefixed to the next read.
//!
//! Known limitation: a single event line longer than [`EVENT_BUF_SIZE`] is
//! delivered as two records, split at the buffer boundary.

use std::io;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::daemon::CoreEvent;
use crate::phy::backend::EventStream;

/// Read buffer size for device event streams.
pub const EVENT_BUF_SIZE: usize = 512;

/// Accumulates raw bytes and yields complete, newline-terminated lines.
#[derive(Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and pushes every completed line (without its
    /// terminator) onto `out`. A partial line that fills the whole buffer is
    /// flushed as-is rather than growing without bound.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        self.carry.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(pos) = self.carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            out.push(String::from_utf8_lossy(&self.carry[start..end]).into_owned());
            start = end + 1;
        }
        self.carry.drain(..start);

        if self.carry.len() >= EVENT_BUF_SIZE {
            out.push(String::from_utf8_lossy(&self.carry).into_owned());
            self.carry.clear();
        }
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Reads a device's event stream until end-of-stream, hard error or
/// cancellation, forwarding complete lines to the core loop in arrival
/// order. End-of-stream and read failures both end in a `PhyHangup` so the
/// registry can tear the device down.
pub async fn run_event_reader(
    phy: String,
    mut stream: EventStream,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; EVENT_BUF_SIZE];
    let mut lines = LineBuffer::new();
    let mut complete = Vec::new();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = stream.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("{phy}: event stream closed");
                break;
            }
            Ok(n) => {
                lines.push(&buf[..n], &mut complete);
                for line in complete.drain(..) {
                    let event = CoreEvent::PhyLine {
                        phy: phy.clone(),
                        line,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{phy}: event stream read failed: {e}");
                break;
            }
        }
    }

    let _ = events.send(CoreEvent::PhyHangup { phy }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(buf: &mut LineBuffer, s: &str) -> Vec<String> {
        let mut out = Vec::new();
        buf.push(s.as_bytes(), &mut out);
        out
    }

    #[test]
    fn splits_complete_lines_in_order() {
        let mut buf = LineBuffer::new();
        let lines = push_str(&mut buf, "1;txs;a\n2;stats;b\n");
        assert_eq!(lines, vec!["1;txs;a", "2;stats;b"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn carries_partial_line_to_next_chunk() {
        let mut buf = LineBuffer::new();
        assert!(push_str(&mut buf, "1;txs;par").is_empty());
        assert_eq!(buf.pending(), 9);
        let lines = push_str(&mut buf, "tial\n3;ok\n");
        assert_eq!(lines, vec!["1;txs;partial", "3;ok"]);
    }

    #[test]
    fn oversized_line_is_flushed_at_buffer_boundary() {
        let mut buf = LineBuffer::new();
        let long = "x".repeat(EVENT_BUF_SIZE);
        let lines = push_str(&mut buf, &long);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), EVENT_BUF_SIZE);
        assert_eq!(buf.pending(), 0);
    }

    #[tokio::test]
    async fn reader_reports_hangup_on_eof() {
        let (client, mut server) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(run_event_reader(
            "phy0".into(),
            Box::new(client),
            tx,
            cancel,
        ));

        use tokio::io::AsyncWriteExt;
        server.write_all(b"100;txs;0,1\npartial").await.unwrap();
        drop(server);
        reader.await.unwrap();

        match rx.recv().await {
            Some(CoreEvent::PhyLine { phy, line }) => {
                assert_eq!(phy, "phy0");
                assert_eq!(line, "100;txs;0,1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(CoreEvent::PhyHangup { .. })));
    }
}
