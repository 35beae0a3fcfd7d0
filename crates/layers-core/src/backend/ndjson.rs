use futures::{Stream, StreamExt};

use super::{BackendError, ChangeStream};
use crate::constants::MAX_CHANGE_LINE_BYTES;
use crate::models::ChangeNotification;

/// Incremental decoder for a newline-delimited JSON change stream. Chunks
/// may split lines anywhere; blank lines are keep-alives.
///
/// A line longer than `max_line` is reported once as a decode error and
/// dropped up to its newline, so a bad peer cannot grow the buffer forever.
#[derive(Debug)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    max_line: usize,
    /// Inside an oversized line; everything up to the next newline is junk
    discarding: bool,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_CHANGE_LINE_BYTES)
    }
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk, returning every complete line decoded in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<ChangeNotification, BackendError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_line {
                out.push(Err(self.oversized()));
                continue;
            }
            out.push(
                serde_json::from_slice::<ChangeNotification>(line)
                    .map_err(|e| BackendError::Decode(e.to_string())),
            );
        }

        if self.buf.len() > self.max_line {
            if !self.discarding {
                out.push(Err(self.oversized()));
                self.discarding = true;
            }
            self.buf.clear();
        }
        out
    }

    fn oversized(&self) -> BackendError {
        BackendError::Decode(format!("change line longer than {} bytes", self.max_line))
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Adapt a byte stream into a [`ChangeStream`].
pub fn decode_stream<S, B, E>(bytes: S) -> ChangeStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: std::fmt::Display + 'static,
{
    bytes
        .scan(NdjsonDecoder::new(), |decoder, chunk| {
            let decoded = match chunk {
                Ok(chunk) => decoder.push(chunk.as_ref()),
                Err(e) => vec![Err(BackendError::Network(e.to_string()))],
            };
            futures::future::ready(Some(futures::stream::iter(decoded)))
        })
        .flatten()
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;

    const DELETE_A: &str = r#"{"type":"delete","record":{"id":"a"}}"#;
    const DELETE_B: &str = r#"{"type":"delete","record":{"id":"b"}}"#;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = NdjsonDecoder::new();
        let full = format!("{}\n{}\n", DELETE_A, DELETE_B);
        let (head, tail) = full.split_at(10);

        assert!(decoder.push(head.as_bytes()).is_empty());
        let decoded = decoder.push(tail.as_bytes());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap().item_id().as_str(), "a");
        assert_eq!(decoded[1].as_ref().unwrap().item_id().as_str(), "b");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_keepalive_lines_are_skipped_and_bad_lines_reported() {
        let mut decoder = NdjsonDecoder::new();
        let decoded = decoder.push(format!("\n  \nnot json\n{}\n", DELETE_A).as_bytes());
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[0], Err(BackendError::Decode(_))));
        assert_eq!(decoded[1].as_ref().unwrap().kind(), ChangeKind::Delete);
    }

    #[test]
    fn test_oversized_line_is_skipped_without_buffering_it() {
        let mut decoder = NdjsonDecoder::with_max_line(64);

        let decoded = decoder.push(&[b'x'; 100]);
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], Err(BackendError::Decode(_))));
        assert_eq!(decoder.pending(), 0);

        // Rest of the same line is dropped silently
        assert!(decoder.push(&[b'y'; 100]).is_empty());
        assert_eq!(decoder.pending(), 0);

        let decoded = decoder.push(format!("tail\n{}\n", DELETE_A).as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap().item_id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_decode_stream_surfaces_transport_errors() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(format!("{}\n", DELETE_A).into_bytes()),
            Err("connection reset".to_string()),
        ];
        let items: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(e) if e.is_connection_loss()));
    }
}
