//! Newline framing for the agent's stdout stream.
//!
//! Chunks arrive split at arbitrary byte offsets (pipe reads, partial writes),
//! so a record may be spread over several reads or several records may share
//! one. `LineFramer` keeps the trailing partial line between calls and only
//! ever yields complete `\n`-terminated records, in write order.
//! Invalid UTF-8 inside a record is replaced with U+FFFD and logged.

use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

const SEPARATOR: u8 = b'\n';

/// Splits a byte stream into complete newline-terminated lines.
///
/// Can be driven directly with [`LineFramer::feed`] or plugged into a
/// `FramedRead` as a [`Decoder`].
#[derive(Debug, Default)]
pub struct LineFramer {
    leftover: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every line it completes.
    ///
    /// A chunk without a separator only extends the leftover. The separator
    /// itself is not part of the emitted line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.leftover.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(line) = self.next_line() {
            lines.push(line);
        }
        lines
    }

    /// Bytes of the current partial line.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.leftover.iter().position(|b| *b == SEPARATOR)?;
        let line = self.leftover.split_to(pos);
        self.leftover.advance(1);
        match String::from_utf8(line.to_vec()) {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::warn!(
                    bytes = line.len(),
                    valid_up_to = e.utf8_error().valid_up_to(),
                    "Replacing invalid UTF-8 in agent output line"
                );
                Some(String::from_utf8_lossy(&line).into_owned())
            }
        }
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            self.leftover.unsplit(src.split());
        }
        Ok(self.next_line())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if !self.leftover.is_empty() {
            tracing::trace!(
                bytes = self.leftover.len(),
                "Discarding unterminated trailing line at EOF"
            );
            self.leftover.clear();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::new();
        chunks.iter().flat_map(|c| framer.feed(c)).collect()
    }

    #[test]
    fn chunk_without_separator_only_buffers() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"{\"id\":0").is_empty());
        assert_eq!(framer.leftover(), b"{\"id\":0");
    }

    #[test]
    fn separator_flushes_leftover_with_first_part() {
        let mut framer = LineFramer::new();
        framer.feed(b"abc");
        assert_eq!(framer.feed(b"def\nxyz"), vec!["abcdef".to_string()]);
        assert_eq!(framer.leftover(), b"xyz");
    }

    #[test]
    fn middle_parts_are_emitted_whole() {
        assert_eq!(
            feed_all(&[b"a\nb\nc\nd".as_slice()]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn chunk_ending_on_separator_leaves_empty_leftover() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed(b"one\ntwo\n"), vec!["one", "two"]);
        assert!(framer.leftover().is_empty());
    }

    #[test]
    fn empty_chunk_is_noop() {
        let mut framer = LineFramer::new();
        framer.feed(b"partial");
        assert!(framer.feed(b"").is_empty());
        assert_eq!(framer.leftover(), b"partial");
    }

    #[test]
    fn empty_lines_are_preserved() {
        assert_eq!(feed_all(&[b"\n\nx\n".as_slice()]), vec!["", "", "x"]);
    }

    #[test]
    fn every_partition_yields_the_written_lines() {
        let lines = ["{\"id\":0,\"result\":{}}", "", "{\"id\":1,\"message\":\"é\"}", "tail"];
        let stream: Vec<u8> = lines.iter().flat_map(|l| format!("{l}\n").into_bytes()).collect();

        // Every pair of split points, including mid-codepoint and mid-line.
        for i in 0..=stream.len() {
            for j in i..=stream.len() {
                let got = feed_all(&[&stream[..i], &stream[i..j], &stream[j..]]);
                assert_eq!(got, lines, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn invalid_utf8_is_replaced_without_losing_neighbours() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"ok\nbad\xff\xfe byte\nnext\n");
        assert_eq!(lines, vec!["ok", "bad\u{fffd}\u{fffd} byte", "next"]);
        assert!(framer.leftover().is_empty());
    }

    #[test]
    fn byte_at_a_time() {
        let stream = b"first\nsecond\nthird\n";
        let chunks: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(feed_all(&chunks), vec!["first", "second", "third"]);
    }

    #[test]
    fn decoder_yields_one_line_per_call() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::from(&b"a\nb\nrest"[..]);

        assert_eq!(framer.decode(&mut buf).unwrap(), Some("a".to_string()));
        assert_eq!(framer.decode(&mut buf).unwrap(), Some("b".to_string()));
        assert_eq!(framer.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\n");
        assert_eq!(framer.decode(&mut buf).unwrap(), Some("rest".to_string()));
    }

    #[test]
    fn decode_eof_discards_unterminated_tail() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::from(&b"done\nhalf"[..]);

        assert_eq!(framer.decode_eof(&mut buf).unwrap(), Some("done".to_string()));
        assert_eq!(framer.decode_eof(&mut buf).unwrap(), None);
        assert!(framer.leftover().is_empty());
    }
}
