//! Streaming-compression pipeline for the compressed subscriber channel.
//!
//! Formatted event records are accumulated in a fixed-capacity input buffer
//! and pushed through a zstd streaming compressor bound to a preloaded
//! dictionary. A flush produces one complete frame and happens when the
//! buffer cannot take the next record or when the idle timer fires. Short
//! control records (presence, errors, dump lines during replay) bypass the
//! batch buffer and are compressed as individual frames so replay latency
//! stays bounded.
//!
//! While no compressed subscriber is connected nothing is buffered at all;
//! a subscriber that joins later gets a fresh dump instead of stale events.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info};
use zstd::bulk::Compressor;
use zstd::stream::raw::{Encoder, InBuffer, Operation, OutBuffer};
use zstd::zstd_safe;

use crate::config::ZstdOptions;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("failed to load dictionary {path}: {source}")]
    DictLoad { path: PathBuf, source: io::Error },

    #[error("failed to create compression context: {0}")]
    Context(io::Error),

    #[error("compression engine error: {0}")]
    Engine(io::Error),

    #[error("record of {len} bytes does not fit buffer of {capacity} bytes")]
    Oversize { len: usize, capacity: usize },
}

/// Input accumulation buffer, output buffer sized to the worst-case
/// compressed bound, and the streaming compressor context. One per process,
/// present only when a dictionary is configured.
pub struct CompressPipeline {
    input: Vec<u8>,
    capacity: usize,
    output: Vec<u8>,
    encoder: Encoder<'static>,
    frame: Compressor<'static>,
    idle_timeout: Duration,
    deadline: Option<Instant>,
}

impl CompressPipeline {
    /// Loads the dictionary and builds both compressor contexts. Any
    /// failure here is fatal to the compressed channel but not to the rest
    /// of the daemon.
    pub fn new(opts: &ZstdOptions) -> Result<Self, CompressError> {
        let dict = load_dictionary(&opts.dictionary)?;
        let encoder =
            Encoder::with_dictionary(opts.level, &dict).map_err(CompressError::Context)?;
        let frame =
            Compressor::with_dictionary(opts.level, &dict).map_err(CompressError::Context)?;

        info!(
            "compression enabled: dictionary {} ({} bytes), level {}, buffer {}",
            opts.dictionary.display(),
            dict.len(),
            opts.level,
            opts.buffer_size,
        );

        Ok(Self {
            input: Vec::with_capacity(opts.buffer_size),
            capacity: opts.buffer_size,
            output: vec![0u8; zstd_safe::compress_bound(opts.buffer_size)],
            encoder,
            frame,
            idle_timeout: Duration::from_millis(opts.timeout_ms),
            deadline: None,
        })
    }

    /// When the idle-flush timer should fire, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    /// Appends a formatted record to the batch buffer.
    ///
    /// With no compressed subscriber connected this is a no-op that also
    /// disarms the idle timer. A record that does not fit the remaining
    /// capacity forces a flush first; one that cannot fit even an empty
    /// buffer is discarded.
    pub fn ingest<F>(&mut self, text: &str, has_subscribers: bool, mut write: F)
    where
        F: FnMut(Bytes),
    {
        if !has_subscribers {
            self.deadline = None;
            self.input.clear();
            return;
        }

        if self.input.len() + text.len() > self.capacity {
            self.flush(&mut write);
        }

        if text.len() > self.capacity {
            error!(
                "discarding record of {} bytes: input buffer holds {}",
                text.len(),
                self.capacity
            );
            return;
        }

        self.input.extend_from_slice(text.as_bytes());
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.idle_timeout);
        }
    }

    /// Compresses the buffered input as one frame, handing every produced
    /// output chunk to `write` as it appears. An engine error discards the
    /// buffered data. No-op on an empty buffer.
    pub fn flush<F>(&mut self, write: &mut F)
    where
        F: FnMut(Bytes),
    {
        self.deadline = None;
        if self.input.is_empty() {
            return;
        }

        if let Err(e) = self.compress_buffered(write) {
            error!("stream compression error: {e}");
        }
        self.input.clear();
    }

    fn compress_buffered<F>(&mut self, write: &mut F) -> Result<(), CompressError>
    where
        F: FnMut(Bytes),
    {
        let mut input = InBuffer::around(&self.input);

        while input.pos < self.input.len() {
            let mut output = OutBuffer::around(self.output.as_mut_slice());
            self.encoder
                .run(&mut input, &mut output)
                .map_err(CompressError::Engine)?;
            if output.pos() > 0 {
                write(Bytes::copy_from_slice(output.as_slice()));
            }
        }

        loop {
            let mut output = OutBuffer::around(self.output.as_mut_slice());
            let remaining = self
                .encoder
                .finish(&mut output, true)
                .map_err(CompressError::Engine)?;
            if output.pos() > 0 {
                write(Bytes::copy_from_slice(output.as_slice()));
            }
            if remaining == 0 {
                debug!("flushed {} bytes", self.input.len());
                return Ok(());
            }
        }
    }

    /// Single-shot compression of one short record into its own frame.
    pub fn compress_frame(&mut self, text: &str) -> Result<Bytes, CompressError> {
        if text.len() > self.capacity {
            return Err(CompressError::Oversize {
                len: text.len(),
                capacity: self.capacity,
            });
        }
        let frame = self
            .frame
            .compress(text.as_bytes())
            .map_err(CompressError::Engine)?;
        Ok(Bytes::from(frame))
    }
}

fn load_dictionary(path: &Path) -> Result<Vec<u8>, CompressError> {
    std::fs::read(path).map_err(|source| CompressError::DictLoad {
        path: path.to_owned(),
        source,
    })
}
