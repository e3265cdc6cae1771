//! Incremental line decoding of an upstream SSE body
//!
//! Lines may span any number of reads, including multi-byte characters split
//! across chunk boundaries. Bytes are buffered until a newline arrives.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};

/// Lazily yields trimmed text lines from a byte stream.
///
/// A read error or the end of the stream ends the sequence. Neither is
/// reported as a failure here; [`LineReader::ended_with_error`] tells the
/// caller which one happened.
pub struct LineReader<S> {
    inner: S,
    buffer: BytesMut,
    /// Bytes of `buffer` already known to hold no newline
    scanned: usize,
    finished: bool,
    errored: bool,
}

impl<S> LineReader<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            scanned: 0,
            finished: false,
            errored: false,
        }
    }

    /// Next line in stream order, or `None` once the stream has ended
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(self.scanned + pos + 1);
                self.scanned = 0;
                return Some(decode(&line));
            }
            self.scanned = self.buffer.len();

            if self.finished {
                // A partial line cut off by a read error may be garbled; drop it.
                self.scanned = 0;
                if self.errored || self.buffer.is_empty() {
                    self.buffer.clear();
                    return None;
                }
                let line = self.buffer.split();
                return Some(decode(&line));
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Upstream body read failed, ending line stream");
                    self.finished = true;
                    self.errored = true;
                }
                None => self.finished = true,
            }
        }
    }

    /// Whether the sequence ended because of a read error rather than EOF
    pub fn ended_with_error(&self) -> bool {
        self.errored
    }

    /// Adapt into a `Stream` of lines
    pub fn into_lines(self) -> impl Stream<Item = String> {
        stream::unfold(self, |mut reader| async move {
            let line = reader.next_line().await?;
            Some((line, reader))
        })
    }
}

fn decode(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim().to_string()
}
