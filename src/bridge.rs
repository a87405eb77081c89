//! In-process byte streams connecting pipeline stages that have no OS pipe
//! between them: subshell boundaries, built-in commands and script blocks.

use std::io;
use tokio::sync::mpsc;
use tracing::warn;

/// Chunks buffered by a bridge before writers start waiting.
pub const DEFAULT_CAPACITY: usize = 16;

/// Create a connected writer/reader pair.
///
/// The channel is bounded, so a fast producer waits for the consumer once
/// `capacity` chunks are in flight. Writers can be cloned; the reader sees
/// end-of-stream once every writer has been dropped.
pub fn bridge(capacity: usize) -> (BridgeWriter, BridgeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BridgeWriter { tx }, BridgeReader { rx })
}

#[derive(Debug, Clone)]
pub struct BridgeWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl BridgeWriter {
    /// Write one chunk, waiting while the bridge is full.
    ///
    /// Fails with [`io::ErrorKind::BrokenPipe`] once the reader is gone.
    pub async fn write(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream bridge closed"))
    }

    /// Blocking variant for producers running outside the async scheduler.
    pub fn blocking_write(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream bridge closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct BridgeReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl BridgeReader {
    /// Next chunk, or `None` once all writers are dropped and the buffer is drained.
    pub async fn read_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn blocking_read_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.blocking_recv()
    }

    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Stop accepting data; pending and future writes fail.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Output collected by a [`Capture`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Consumer end used by capture mode: accumulates everything written into
/// memory, keeping at most `limit` bytes.
#[derive(Debug)]
pub struct Capture {
    reader: BridgeReader,
    limit: Option<usize>,
}

/// Create a capture sink. `limit` of `None` keeps everything.
pub fn capture(capacity: usize, limit: Option<usize>) -> (BridgeWriter, Capture) {
    let (writer, reader) = bridge(capacity);
    (writer, Capture { reader, limit })
}

impl Capture {
    /// Drain until every writer is dropped.
    ///
    /// Bytes beyond the limit are read and discarded so producers never stall
    /// on a full capture.
    pub async fn collect(mut self) -> Captured {
        let mut captured = Captured::default();
        while let Some(chunk) = self.reader.read_chunk().await {
            let room = match self.limit {
                Some(limit) => limit.saturating_sub(captured.bytes.len()),
                None => chunk.len(),
            };
            if room < chunk.len() {
                if !captured.truncated {
                    warn!(limit = ?self.limit, "captured output exceeds limit, truncating");
                }
                captured.truncated = true;
            }
            captured
                .bytes
                .extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
        captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn reader_sees_eof_after_all_writers_drop() {
        let (writer, mut reader) = bridge(4);
        let second = writer.clone();
        writer.write(b"one ").await.unwrap();
        second.write(b"two").await.unwrap();
        drop(writer);
        drop(second);
        assert_eq!(reader.read_to_end().await, b"one two");
    }

    #[tokio::test]
    async fn full_bridge_applies_backpressure() {
        let (writer, mut reader) = bridge(1);
        assert!(writer.write(b"a").now_or_never().is_some());
        assert!(writer.write(b"b").now_or_never().is_none());

        assert_eq!(reader.read_chunk().await.as_deref(), Some(&b"a"[..]));
        writer.write(b"b").await.unwrap();
        assert_eq!(reader.read_chunk().await.as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn write_after_reader_close_is_broken_pipe() {
        let (writer, mut reader) = bridge(1);
        reader.close();
        let err = writer.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn capture_keeps_bytes_exactly() {
        let (writer, capture) = capture(2, None);
        let producer = async move {
            for part in [&b"hi"[..], b"\n", b"", b"there\n"] {
                writer.write(part).await.unwrap();
            }
        };
        let ((), captured) = tokio::join!(producer, capture.collect());
        assert_eq!(captured.bytes, b"hi\nthere\n");
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn capture_truncates_at_limit_without_stalling() {
        let (writer, capture) = capture(1, Some(4));
        let producer = async move {
            for _ in 0..10 {
                writer.write(b"abc").await.unwrap();
            }
        };
        let ((), captured) = tokio::join!(producer, capture.collect());
        assert_eq!(captured.bytes, b"abca");
        assert!(captured.truncated);
    }
}
