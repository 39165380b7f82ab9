//! Removal of Docker's stdout/stderr multiplexing headers.
//!
//! Non-TTY log and exec streams prefix each frame with an 8-byte header:
//! byte 0 is the stream (`1` stdout, `2` stderr), bytes 1-3 are zero and
//! bytes 4-7 hold the big-endian payload length. Stripping works per line:
//! a line longer than 8 bytes starting with `1` or `2` loses its first 8
//! bytes. A payload with an embedded newline puts the next header mid-line,
//! where it is not detected.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

const HEADER_LEN: usize = 8;

/// Strip a multiplexing header from the start of one line.
pub fn strip_header(line: &[u8]) -> &[u8] {
    if line.len() > HEADER_LEN && matches!(line[0], 1 | 2) {
        &line[HEADER_LEN..]
    } else {
        line
    }
}

/// Strip headers from every newline-terminated line of `buf`.
pub fn strip_lines(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    for line in buf.split_inclusive(|b| *b == b'\n') {
        out.extend_from_slice(strip_header(line));
    }
    out
}

/// Reassembles arbitrary chunks into header-stripped lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: BytesMut,
}

impl LineSplitter {
    /// Feed a chunk, returning every line it completed (each ending in `\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(pos + 1);
            lines.push(Bytes::copy_from_slice(strip_header(&line)));
        }
        lines
    }

    /// Flush a trailing partial line, terminated with `\n`.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        let mut line = BytesMut::from(strip_header(&rest));
        line.extend_from_slice(b"\n");
        Some(line.freeze())
    }
}

/// Turn a raw log byte stream into a stream of header-stripped lines.
///
/// An upstream error is yielded once and ends the stream.
pub fn lines<S, E>(source: S) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
    E: Send,
{
    let state = (source, LineSplitter::default(), VecDeque::new(), false);
    futures::stream::unfold(
        state,
        |(mut source, mut splitter, mut ready, mut done)| async move {
            loop {
                if let Some(line) = ready.pop_front() {
                    return Some((Ok(line), (source, splitter, ready, done)));
                }
                if done {
                    return None;
                }
                match source.next().await {
                    Some(Ok(chunk)) => ready.extend(splitter.push(&chunk)),
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e), (source, splitter, ready, done)));
                    }
                    None => {
                        done = true;
                        ready.extend(splitter.finish());
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_strip_stdout_header() {
        let line = framed(1, b"x\n");
        assert_eq!(line.len(), 10);
        assert_eq!(strip_header(&line), b"x\n");
    }

    #[test]
    fn test_strip_removes_exactly_eight_bytes() {
        let line = [1u8, 0, 0, 0, 0, 0, 0, 1, b'z'];
        assert_eq!(strip_header(&line), b"z");
    }

    #[test]
    fn test_short_line_unchanged() {
        let line = [1u8, 0, 0, 0, 5];
        assert_eq!(strip_header(&line), &line[..]);
    }

    #[test]
    fn test_exactly_eight_bytes_unchanged() {
        let line = [2u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(strip_header(&line), &line[..]);
    }

    #[test]
    fn test_other_first_byte_unchanged() {
        let line = [3u8, 0, 0, 0, 0, 0, 0, 4, b'a', b'b', b'c', b'd'];
        assert_eq!(strip_header(&line), &line[..]);
        assert_eq!(strip_header(b"plain text line\n"), b"plain text line\n");
    }

    #[test]
    fn test_strip_lines_mixed_streams() {
        let mut buf = framed(1, b"out\n");
        buf.extend(framed(2, b"err\n"));
        assert_eq!(strip_lines(&buf), b"out\nerr\n");
    }

    #[test]
    fn test_embedded_newline_desynchronizes() {
        // Payload lines after the first carry no header
        let mut buf = framed(1, b"a\nb\n");
        buf.extend(framed(1, b"c\n"));
        assert_eq!(strip_lines(&buf), b"a\nb\nc\n");

        // A payload not ending in a newline hides the next header mid-line
        let mut buf = framed(1, b"a\nbb");
        buf.extend(framed(1, b"c\n"));
        let out = strip_lines(&buf);
        assert!(out.starts_with(b"a\nbb\x01"));
    }

    #[test]
    fn test_splitter_reassembles_chunks() {
        let data = [framed(1, b"hello\n"), framed(2, b"world\n")].concat();
        let mut splitter = LineSplitter::default();
        let mut lines = Vec::new();
        for chunk in data.chunks(3) {
            lines.extend(splitter.push(chunk));
        }
        assert!(splitter.finish().is_none());
        assert_eq!(lines, vec![Bytes::from("hello\n"), Bytes::from("world\n")]);
    }

    #[test]
    fn test_splitter_flushes_partial_line() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"no newline").is_empty());
        assert_eq!(splitter.finish(), Some(Bytes::from("no newline\n")));
    }

    #[tokio::test]
    async fn test_lines_stream() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from(framed(1, b"one\ntw"))),
            Ok(Bytes::from("o\n")),
            Ok(Bytes::from("tail")),
        ];
        let out: Vec<Result<Bytes, String>> =
            lines(futures::stream::iter(chunks)).collect().await;
        let out: Vec<Bytes> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            out,
            vec![
                Bytes::from("one\n"),
                Bytes::from("two\n"),
                Bytes::from("tail\n")
            ]
        );
    }

    #[tokio::test]
    async fn test_lines_stream_stops_after_error() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from("a\n")),
            Err("daemon went away".to_string()),
            Ok(Bytes::from("never\n")),
        ];
        let out: Vec<Result<Bytes, String>> =
            lines(futures::stream::iter(chunks)).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }
}
