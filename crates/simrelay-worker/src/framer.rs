//! Newline-delimited JSON framing of worker output.
//!
//! [`LineFramer`] turns an arbitrarily chunked byte stream into JSON documents,
//! one per line. Bytes after the last newline are carried over to the next
//! chunk, so a document split across two reads is still decoded once.
//! Lines that are not JSON are discarded and never abort the stream.

use serde_json::Value;
use simrelay_core::{RelayError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

/// Size of each read from the worker's stdout.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Incremental newline-delimited JSON decoder.
#[derive(Debug)]
pub struct LineFramer {
    /// Bytes seen since the last newline
    carry: Vec<u8>,
    /// Carry-over limit; beyond it the line is dropped up to the next newline
    max_line_bytes: usize,
    /// Set while skipping the rest of an oversized line
    overflowed: bool,
    /// Lines discarded as noise
    discarded: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(simrelay_core::config::DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    /// Create a framer that discards lines longer than `max_line_bytes`.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            carry: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            overflowed: false,
            discarded: 0,
        }
    }

    /// Feed a chunk of bytes, returning every document completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut documents = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.overflowed {
                // Tail end of an oversized line
                self.overflowed = false;
                continue;
            }

            if self.carry.len() + head.len() > self.max_line_bytes {
                self.discard_oversized(self.carry.len() + head.len());
                self.carry.clear();
            } else if self.carry.is_empty() {
                self.emit(head, &mut documents);
            } else {
                self.carry.extend_from_slice(head);
                let line = std::mem::take(&mut self.carry);
                self.emit(&line, &mut documents);
            }
        }

        if !self.overflowed {
            self.carry.extend_from_slice(rest);
            if self.carry.len() > self.max_line_bytes {
                self.discard_oversized(self.carry.len());
                self.carry.clear();
                self.overflowed = true;
            }
        }

        documents
    }

    /// Give any remaining carry-over one last parse attempt at end of stream.
    pub fn finish(&mut self) -> Option<Value> {
        self.overflowed = false;
        let line = std::mem::take(&mut self.carry);
        let mut documents = Vec::with_capacity(1);
        self.emit(&line, &mut documents);
        documents.pop()
    }

    /// Number of lines discarded as noise so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    fn discard_oversized(&mut self, bytes: usize) {
        warn!(
            bytes,
            limit = self.max_line_bytes,
            "worker output line exceeds limit, discarding"
        );
        self.discarded += 1;
    }

    fn emit(&mut self, line: &[u8], documents: &mut Vec<Value>) {
        match parse_line(line) {
            Ok(Some(value)) => documents.push(value),
            Ok(None) => {}
            Err(e) => {
                self.discarded += 1;
                debug!(error = %e, "discarding non-JSON worker output");
            }
        }
    }
}

/// Parse one line of worker output.
///
/// Returns `Ok(None)` for blank lines and `MalformedOutputLine` for anything
/// that is not a single JSON document.
pub fn parse_line(line: &[u8]) -> Result<Option<Value>> {
    let text = std::str::from_utf8(line)
        .map_err(|e| RelayError::malformed_line(String::from_utf8_lossy(line), e.to_string()))?;

    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| RelayError::malformed_line(text, e.to_string()))
}

/// Totals reported when a framed stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Documents handed to the sink
    pub fragments: u64,
    /// Lines discarded as noise
    pub discarded: u64,
    /// Raw bytes read
    pub bytes: u64,
}

/// Drive a [`LineFramer`] from an async reader until end of stream.
///
/// Each decoded document is passed to `sink` in the order it was written.
/// A read error ends the stream like EOF does, after the carry-over has been
/// flushed.
pub async fn frame_reader<R, F>(mut reader: R, max_line_bytes: usize, mut sink: F) -> FrameStats
where
    R: AsyncRead + Unpin,
    F: FnMut(Value),
{
    let mut framer = LineFramer::new(max_line_bytes);
    let mut stats = FrameStats::default();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                stats.bytes += n as u64;
                trace!(bytes = n, "worker output chunk");
                for document in framer.push(&buf[..n]) {
                    stats.fragments += 1;
                    sink(document);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "reading worker output failed");
                break;
            }
        }
    }

    if let Some(document) = framer.finish() {
        stats.fragments += 1;
        sink(document);
    }

    stats.discarded = framer.discarded();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame_chunks(chunks: &[&[u8]]) -> Vec<Value> {
        frame_chunks_limited(chunks, simrelay_core::config::DEFAULT_MAX_LINE_BYTES)
    }

    fn frame_chunks_limited(chunks: &[&[u8]], max_line_bytes: usize) -> Vec<Value> {
        let mut framer = LineFramer::new(max_line_bytes);
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(framer.push(chunk));
        }
        out.extend(framer.finish());
        out
    }

    #[test]
    fn test_single_chunk_two_documents() {
        let docs = frame_chunks(&[b"{\"step\":1}\n{\"step\":2}\n"]);
        assert_eq!(docs, vec![json!({"step": 1}), json!({"step": 2})]);
    }

    #[test]
    fn test_document_split_across_reads() {
        let docs = frame_chunks(&[b"{\"a\":", b"1}\n"]);
        assert_eq!(docs, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_every_chunking_yields_same_documents() {
        let output: &[u8] = b"{\"step\":1}\r\nnoise line\n\n  {\"step\":2,\"s\":\"\xc3\xa9\"}  \n[1,2]\n{\"tail\":true}";
        let expected = frame_chunks(&[output]);
        assert_eq!(expected.len(), 4);

        for size in 1..=output.len() {
            let chunks: Vec<&[u8]> = output.chunks(size).collect();
            assert_eq!(frame_chunks(&chunks), expected, "chunk size {size}");
        }

        // Every two-way split point, including inside a multi-byte character
        for split in 0..=output.len() {
            let (a, b) = output.split_at(split);
            assert_eq!(frame_chunks(&[a, b]), expected, "split at {split}");
        }
    }

    #[test]
    fn test_every_chunking_drops_oversized_lines_alike() {
        let output: &[u8] = b"{\"a\":1}\n123456789\n[1,2]\n\"0123456789\"\n7\n";
        let expected = frame_chunks_limited(&[output], 8);
        assert_eq!(expected, vec![json!({"a": 1}), json!([1, 2]), json!(7)]);

        for size in 1..=output.len() {
            let chunks: Vec<&[u8]> = output.chunks(size).collect();
            assert_eq!(frame_chunks_limited(&chunks, 8), expected, "chunk size {size}");
        }

        for split in 0..=output.len() {
            let (a, b) = output.split_at(split);
            assert_eq!(frame_chunks_limited(&[a, b], 8), expected, "split at {split}");
        }
    }

    #[test]
    fn test_oversized_line_within_one_chunk_is_discarded() {
        let mut whole = LineFramer::new(8);
        assert!(whole.push(b"123456789\n").is_empty());
        assert_eq!(whole.discarded(), 1);

        let mut split = LineFramer::new(8);
        assert!(split.push(b"123456789").is_empty());
        assert!(split.push(b"\n").is_empty());
        assert_eq!(split.discarded(), 1);

        let mut exact = LineFramer::new(8);
        assert_eq!(exact.push(b"12345678\n"), vec![json!(12345678)]);
    }

    #[test]
    fn test_malformed_line_is_discarded() {
        let mut framer = LineFramer::default();
        let docs = framer.push(b"{\"step\":1}\nnot-json\n{\"step\":2}\n");
        assert_eq!(docs, vec![json!({"step": 1}), json!({"step": 2})]);
        assert_eq!(framer.discarded(), 1);
    }

    #[test]
    fn test_blank_lines_are_not_noise() {
        let mut framer = LineFramer::default();
        let docs = framer.push(b"\n   \n\t\n");
        assert!(docs.is_empty());
        assert_eq!(framer.discarded(), 0);
    }

    #[test]
    fn test_carry_over_held_until_newline() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"partial\":").is_empty());
        assert_eq!(framer.pending(), 11);
        assert_eq!(framer.push(b"true}\n"), vec![json!({"partial": true})]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_finish_parses_unterminated_document() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"last\":1}").is_empty());
        assert_eq!(framer.finish(), Some(json!({"last": 1})));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_finish_discards_unterminated_noise() {
        let mut framer = LineFramer::default();
        framer.push(b"Traceback (most recent");
        assert_eq!(framer.finish(), None);
        assert_eq!(framer.discarded(), 1);
    }

    #[test]
    fn test_invalid_utf8_is_noise() {
        let mut framer = LineFramer::default();
        let docs = framer.push(b"\xff\xfe\n{\"ok\":1}\n");
        assert_eq!(docs, vec![json!({"ok": 1})]);
        assert_eq!(framer.discarded(), 1);
    }

    #[test]
    fn test_oversized_line_skipped_to_next_newline() {
        let mut framer = LineFramer::new(8);
        assert!(framer.push(b"{\"big\":\"0123456789").is_empty());
        assert_eq!(framer.pending(), 0);
        let docs = framer.push(b"abcdef\"}\n{\"a\":1}\n");
        assert_eq!(docs, vec![json!({"a": 1})]);
        assert_eq!(framer.discarded(), 1);
    }

    #[test]
    fn test_parse_line_results() {
        assert!(parse_line(b"  ").unwrap().is_none());
        assert_eq!(parse_line(b" 42 ").unwrap(), Some(json!(42)));
        assert!(matches!(
            parse_line(b"{\"a\":"),
            Err(RelayError::MalformedOutputLine { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_collects_in_order() {
        let input: &[u8] = b"{\"step\":1}\nnot-json\n{\"step\":2}\n{\"step\":3}";
        let mut seen = Vec::new();
        let stats = frame_reader(input, 1024, |doc| seen.push(doc)).await;

        assert_eq!(seen, vec![json!({"step": 1}), json!({"step": 2}), json!({"step": 3})]);
        assert_eq!(stats.fragments, 3);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.bytes, input.len() as u64);
    }
}
