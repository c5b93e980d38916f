//! Envelope framing over the prover's stdio.
//!
//! The ide protocol is line-oriented on the way out (one command, one
//! newline) and tag-delimited on the way in: a reply is a complete
//! `<feedback>`, `<value>` or `<message>` element, possibly preceded by
//! noise (version banners, stray warnings) that is not part of any
//! envelope. [`EnvelopeReader`] frames replies with an incremental
//! tokenizer that tracks tag depth — no regex over the live stream, so a
//! large goal payload cannot trigger pathological backtracking.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Root tags that delimit a reply envelope. Older coqtop versions emit
/// bare `message` elements instead of wrapping them in `feedback`.
const ROOT_TAGS: [&str; 3] = ["feedback", "value", "message"];

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Result of scanning the buffer for one complete envelope.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// `buf[start..end]` is a complete envelope; `buf[..start]` is noise.
    Complete { start: usize, end: usize },
    NeedMore,
}

/// Reads reply envelopes from the prover's stdout.
pub struct EnvelopeReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Block until the stream holds one complete envelope and return its
    /// exact span. Bytes preceding the envelope are discarded with a
    /// warning. There is no timeout: a stalled prover blocks the caller
    /// indefinitely.
    pub async fn read_envelope(&mut self) -> Result<String, ProtocolError> {
        loop {
            if let Scan::Complete { start, end } = scan_envelope(&self.buf) {
                if self.buf[..start].iter().any(|b| !b.is_ascii_whitespace()) {
                    tracing::warn!(
                        "skipping unexpected prover output: {:?}",
                        String::from_utf8_lossy(&self.buf[..start])
                    );
                }
                let envelope = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
                self.buf.drain(..end);
                tracing::debug!("received prover reply: {envelope:?}");
                return Ok(envelope);
            }

            let mut chunk = [0u8; READ_CHUNK_BYTES];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProtocolError::UnexpectedEof);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes command text to the prover's stdin, one command per line.
pub struct CommandWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, wire: &str) -> Result<(), ProtocolError> {
        tracing::debug!("sending prover command: {wire:?}");
        self.writer.write_all(wire.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// One markup tag, as seen by the depth tracker.
enum Tag {
    Open,
    Close,
    SelfClosing,
}

/// Scan for the first complete envelope in `buf`.
fn scan_envelope(buf: &[u8]) -> Scan {
    let Some(start) = find_root_open(buf) else {
        return Scan::NeedMore;
    };

    let mut depth = 0usize;
    let mut pos = start;
    loop {
        let Some(lt) = memchr(buf, pos, b'<') else {
            return Scan::NeedMore;
        };
        let Some((kind, after)) = read_tag(buf, lt) else {
            return Scan::NeedMore;
        };
        match kind {
            Tag::Open => depth += 1,
            Tag::SelfClosing => {
                if depth == 0 {
                    // Root element with no content; not produced by any
                    // known prover version but a valid envelope regardless.
                    return Scan::Complete { start, end: after };
                }
            }
            Tag::Close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Complete { start, end: after };
                }
            }
        }
        pos = after;
    }
}

/// First position where one of the recognized root tags opens.
fn find_root_open(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(lt) = memchr(buf, pos, b'<') {
        for name in ROOT_TAGS {
            let name = name.as_bytes();
            let Some(rest) = buf.get(lt + 1..) else {
                return None;
            };
            if rest.starts_with(name) {
                // The name must end at a tag boundary so `<message_level>`
                // is not mistaken for a `<message>` root.
                match rest.get(name.len()) {
                    Some(b' ' | b'\t' | b'\r' | b'\n' | b'>' | b'/') => return Some(lt),
                    // Buffer ends exactly at the name; could still be a
                    // longer tag name. Wait for more bytes.
                    None => return None,
                    Some(_) => {}
                }
            }
        }
        pos = lt + 1;
    }
    None
}

/// Read the tag starting at `buf[lt]` (which must be `<`). Returns its
/// kind and the offset just past the closing `>`, or `None` if the tag is
/// still incomplete. Quoted attribute values may contain `>`.
fn read_tag(buf: &[u8], lt: usize) -> Option<(Tag, usize)> {
    let is_close = buf.get(lt + 1) == Some(&b'/');
    let mut quote: Option<u8> = None;
    let mut prev = b'<';
    let mut pos = lt + 1;
    while let Some(&b) = buf.get(pos) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => {
                    let kind = if is_close {
                        Tag::Close
                    } else if prev == b'/' {
                        Tag::SelfClosing
                    } else {
                        Tag::Open
                    };
                    return Some((kind, pos + 1));
                }
                _ => {}
            },
        }
        prev = b;
        pos += 1;
    }
    None
}

fn memchr(buf: &[u8], from: usize, needle: u8) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
}
