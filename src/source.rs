//! Capture stream reader.
//!
//! The capture layer delivers fixed-width event records over a byte stream
//! (a Unix socket in production). The reader decodes one record at a time
//! and forwards it to the aggregation worker over the bounded event queue;
//! a full queue blocks the reader, which is how backpressure reaches the
//! capture layer.

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{broadcast, mpsc},
};
use tracing::{error, info, warn};

use crate::record::{DecodeError, DecodedEvent, RawEventRecord, RECORD_LEN};

/// Outcome of reading one fixed-width frame from the capture stream.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// The buffer holds a complete record.
    Complete,
    /// The stream closed cleanly on a record boundary.
    Closed,
    /// The stream closed mid-record; `0` holds the bytes that did arrive.
    Truncated(usize),
}

async fn read_frame<R>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                Frame::Closed
            } else {
                Frame::Truncated(filled)
            });
        }
        filled += n;
    }
    Ok(Frame::Complete)
}

pub struct EventReader<R> {
    stream: R,
    events_tx: mpsc::Sender<DecodedEvent>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<R> EventReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        stream: R,
        events_tx: mpsc::Sender<DecodedEvent>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            events_tx,
            shutdown_rx,
        }
    }

    /// Reads records until the stream closes, a shutdown signal arrives, or
    /// the aggregation side goes away.
    ///
    /// A malformed or truncated trailing record is reported and dropped;
    /// it never reaches the aggregates.
    pub async fn run(mut self) {
        info!(event.name = "source.started", "capture stream reader started");

        let mut buf = [0u8; RECORD_LEN];
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(event.name = "source.stopped", "capture stream reader stopped");
                    return;
                }
                result = read_frame(&mut self.stream, &mut buf) => match result {
                    Ok(Frame::Complete) => {
                        let record = RawEventRecord::from_bytes(&buf);
                        let event = DecodedEvent::from_record(&record);
                        if self.events_tx.send(event).await.is_err() {
                            // Aggregator is gone; nothing left to feed.
                            break;
                        }
                    }
                    Ok(Frame::Closed) => {
                        info!(
                            event.name = "source.stream_closed",
                            "capture layer closed the stream"
                        );
                        break;
                    }
                    Ok(Frame::Truncated(got)) => {
                        warn!(
                            event.name = "source.record_dropped",
                            error.message = %DecodeError::Truncated { got, need: RECORD_LEN },
                            "dropping truncated trailing record"
                        );
                        break;
                    }
                    Err(e) => {
                        error!(
                            event.name = "source.read_failed",
                            error.message = %e,
                            "capture stream read failed"
                        );
                        break;
                    }
                }
            }
        }
    }
}
