//! Frame Decoder
//!
//! Reassembles newline-terminated text lines from notification chunks.
//! A line is only emitted once its terminator has arrived; the unterminated
//! tail stays buffered until the next chunk or a reset.

use crate::infrastructure::bluetooth::protocol::LINE_TERMINATOR;

#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate over the lines it completes.
    ///
    /// Lines are trimmed and empty ones are skipped. Buffering is done on
    /// bytes, so a UTF-8 sequence split across chunks decodes intact. Lines
    /// the iterator has not yet yielded stay buffered if it is dropped early.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.pending.extend_from_slice(chunk);
        Lines {
            pending: &mut self.pending,
        }
    }

    /// Drop any partial line (new connection).
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

pub struct Lines<'a> {
    pending: &'a mut Vec<u8>,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let end = self.pending.iter().position(|&b| b == LINE_TERMINATOR)?;
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            let line = text.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b"12.0,-3.5,980\n\n  1600,2,0 \r\n\xC3\xA9t\xC3\xA9\n7,3\ntail";

    fn decode_all(chunks: &[&[u8]]) -> (Vec<String>, usize) {
        let mut decoder = FrameDecoder::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(decoder.feed(chunk));
        }
        (lines, decoder.pending_len())
    }

    fn expected() -> Vec<String> {
        vec![
            "12.0,-3.5,980".to_string(),
            "1600,2,0".to_string(),
            "été".to_string(),
            "7,3".to_string(),
        ]
    }

    #[test]
    fn test_whole_stream_in_one_chunk() {
        let (lines, pending) = decode_all(&[STREAM]);
        assert_eq!(lines, expected());
        assert_eq!(pending, "tail".len());
    }

    #[test]
    fn test_every_two_way_split() {
        for split in 0..=STREAM.len() {
            let (a, b) = STREAM.split_at(split);
            let (lines, _) = decode_all(&[a, b]);
            assert_eq!(lines, expected(), "split at {}", split);
        }
    }

    #[test]
    fn test_every_three_way_split() {
        for first in 0..=STREAM.len() {
            for second in first..=STREAM.len() {
                let (lines, _) =
                    decode_all(&[&STREAM[..first], &STREAM[first..second], &STREAM[second..]]);
                assert_eq!(lines, expected(), "splits at {} and {}", first, second);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let chunks: Vec<&[u8]> = STREAM.chunks(1).collect();
        let (lines, pending) = decode_all(&chunks);
        assert_eq!(lines, expected());
        assert_eq!(pending, 4);
    }

    #[test]
    fn test_no_speculative_line() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(b"SHO").count(), 0);
        assert_eq!(decoder.feed(b"OT").count(), 0);
        assert_eq!(decoder.feed(b"\n").collect::<Vec<_>>(), vec!["SHOOT"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_blank_lines_are_dropped() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(b"\n \n\t\r\n").count(), 0);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_early_drop_keeps_remaining_lines() {
        let mut decoder = FrameDecoder::new();
        let first = decoder.feed(b"a\nb\nc").next();
        assert_eq!(first.as_deref(), Some("a"));

        let rest: Vec<String> = decoder.feed(b"\n").collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[test]
    fn test_reset_discards_partial_line() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(b"1,2,").count(), 0);
        decoder.reset();
        assert_eq!(decoder.feed(b"3\n").collect::<Vec<_>>(), vec!["3"]);
    }
}
