//! Incremental `multipart/x-mixed-replace` parser

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

/// Parts larger than this are discarded along with the buffer
pub const MAX_PART_SIZE: usize = 8 * 1024 * 1024;

/// Splits a chunked multipart body into part payloads.
///
/// Honors `Content-Length` when a part carries one; otherwise a part ends
/// where the next delimiter begins.
pub struct MultipartParser {
    delimiter: Vec<u8>,
    buf: BytesMut,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            delimiter: format!("--{}", boundary).into_bytes(),
            buf: BytesMut::new(),
        }
    }

    /// Feed one chunk; returns every part completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &self.delimiter) else {
                // Keep a tail that could be the start of a split delimiter
                let keep = self.delimiter.len().saturating_sub(1);
                if self.buf.len() > keep {
                    let drop = self.buf.len() - keep;
                    self.buf.advance(drop);
                }
                break;
            };
            if start > 0 {
                self.buf.advance(start);
            }

            let after = self.delimiter.len();
            let Some(header_len) = find(&self.buf[after..], b"\r\n\r\n") else {
                break;
            };
            let body_start = after + header_len + 4;
            let content_length = content_length(&self.buf[after..after + header_len]);

            let body_end = match content_length {
                Some(len) if self.buf.len() >= body_start + len => body_start + len,
                Some(_) => break,
                None => {
                    let mut terminator = b"\r\n".to_vec();
                    terminator.extend_from_slice(&self.delimiter);
                    match find(&self.buf[body_start..], &terminator) {
                        Some(end) => body_start + end,
                        None => break,
                    }
                }
            };

            let mut part = self.buf.split_to(body_end);
            part.advance(body_start);
            parts.push(part.freeze());
        }

        if self.buf.len() > MAX_PART_SIZE {
            warn!(bytes = self.buf.len(), "Multipart part too large, discarding");
            self.buf.clear();
        }

        parts
    }

    /// Bytes held waiting for the rest of a part
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
