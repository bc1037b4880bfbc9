use bytes::{Bytes, BytesMut};

use crate::error::KubeClientError;

/// Splits a watch body into newline-terminated lines.
///
/// Chunks may end anywhere, including inside a UTF-8 sequence; lines are
/// only handed out once their terminating `\n` has arrived. Blank lines
/// (keep-alives) are skipped and a trailing `\r` is removed.
#[derive(Debug)]
pub(super) struct LineDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for a terminator.
    scanned: usize,
    max_line: usize,
}

impl LineDecoder {
    pub(super) fn new(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_line,
        }
    }

    pub(super) fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete, non-blank line. `Ok(None)` means more input is needed.
    pub(super) fn next_line(&mut self) -> Result<Option<Bytes>, KubeClientError> {
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let end = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            if line.len() > self.max_line {
                return Err(self.too_long(line.len()));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line.freeze()));
        }

        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line {
            return Err(self.too_long(self.buffer.len()));
        }
        Ok(None)
    }

    /// Called at end of input. Unterminated content is an error.
    pub(super) fn finish(&self) -> Result<(), KubeClientError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(KubeClientError::Protocol(format!(
                "stream ended inside an event ({} bytes without a line terminator)",
                self.buffer.len()
            )))
        }
    }

    fn too_long(&self, len: usize) -> KubeClientError {
        KubeClientError::Protocol(format!(
            "watch event of {len} bytes exceeds the {} byte limit",
            self.max_line
        ))
    }
}
