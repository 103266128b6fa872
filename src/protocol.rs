//! AMI packet decoding
//!
//! Asterisk frames every packet as `Key: Value\r\n` lines closed by a bare
//! `\r\n`. The parser buffers raw socket bytes, cuts them into lines and
//! groups lines into [`Packet`]s.

use crate::{
    constants::{HEADER_SEPARATOR, MAX_BUFFER_SIZE, MAX_LINE_SIZE},
    error::{AmiError, AmiResult},
    headers::AmiHeader,
    packet::Packet,
};
use tracing::{debug, trace};

/// AMI protocol parser
///
/// Owns the unconsumed bytes and the packet currently being assembled. One
/// parser per connection; drop it with the socket.
#[derive(Debug, Default)]
pub struct AmiParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already handed out as lines.
    consumed: usize,
    current: Packet,
}

impl AmiParser {
    /// Create new parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        if self.consumed > 0 {
            self.buffer
                .drain(..self.consumed);
            self.consumed = 0;
        }
        self.buffer
            .extend_from_slice(data);
        if self
            .buffer
            .len()
            > MAX_BUFFER_SIZE
        {
            return Err(AmiError::protocol_error(format!(
                "Buffer size {} exceeds limit {}",
                self.buffer
                    .len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Take the next complete line from the buffer, terminator stripped.
    ///
    /// Accepts `\r\n` and bare `\n`. Invalid UTF-8 is replaced rather than
    /// rejected.
    pub fn next_line(&mut self) -> AmiResult<Option<String>> {
        let pending = &self.buffer[self.consumed..];
        let Some(pos) = pending
            .iter()
            .position(|b| *b == b'\n')
        else {
            if pending.len() > MAX_LINE_SIZE {
                return Err(AmiError::protocol_error(format!(
                    "Line exceeds {} bytes without a terminator",
                    MAX_LINE_SIZE
                )));
            }
            return Ok(None);
        };

        let mut line = &pending[..pos];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let line = String::from_utf8_lossy(line).into_owned();
        self.consumed += pos + 1;
        Ok(Some(line))
    }

    /// Feed one terminator-stripped line.
    ///
    /// Returns the sealed packet when `line` is blank. The sealed packet may
    /// be empty.
    pub fn feed(&mut self, line: &str) -> Option<Packet> {
        if line.is_empty() {
            return Some(std::mem::take(&mut self.current));
        }

        match line.split_once(HEADER_SEPARATOR) {
            // Command output repeats `Output` once per line.
            Some((key, value)) if key.trim() == AmiHeader::Output.as_str() => {
                self.current
                    .append_header(key.trim(), value.trim_end());
            }
            Some((key, value)) => {
                self.current
                    .set_header(key.trim(), value.trim());
            }
            None => {
                debug!("Ignoring malformed line: {:?}", line);
            }
        }
        None
    }

    /// Try to assemble a complete packet from the buffer
    pub fn parse_packet(&mut self) -> AmiResult<Option<Packet>> {
        while let Some(line) = self.next_line()? {
            if let Some(packet) = self.feed(&line) {
                trace!("[RECV] Sealed packet with {} headers", packet.len());
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }

    /// Whether headers have been accumulated for an unsealed packet.
    pub fn has_partial_packet(&self) -> bool {
        !self
            .current
            .is_empty()
    }

    /// Drop buffered bytes and the partial packet.
    pub fn reset(&mut self) {
        self.buffer
            .clear();
        self.consumed = 0;
        self.current = Packet::new();
    }
}
