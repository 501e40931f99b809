//! Turns a raw byte stream into a sequence of line-framed messages.
use super::{Message, WireError, MAX_MESSAGE_LEN};

/// Buffers partial reads off a socket and yields complete [`Message`]s as
/// soon as a full line is available.
#[derive(Debug, Default)]
pub struct LineDecoder {
    unparsed: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            unparsed: Vec::with_capacity(MAX_MESSAGE_LEN),
        }
    }

    /// Feed newly-read bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next buffered message, if a full line is ready.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A line (including its
    /// terminator) that would exceed [`MAX_MESSAGE_LEN`] is a framing error.
    pub fn decode_next(&mut self) -> Result<Option<Message>, WireError> {
        let Some(newline_at) = self.unparsed.iter().position(|&b| b == b'\n') else {
            if self.unparsed.len() > MAX_MESSAGE_LEN {
                return Err(WireError::TooLong(self.unparsed.len()));
            }
            return Ok(None);
        };

        let line: Vec<u8> = self.unparsed.drain(..=newline_at).collect();
        let line = &line[..line.len() - 1]; // strip the newline itself

        if line.len() > MAX_MESSAGE_LEN {
            return Err(WireError::TooLong(line.len()));
        }

        let line = std::str::from_utf8(line).map_err(|_| WireError::NotUtf8)?;
        Message::parse(line).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::code;

    #[test]
    fn yields_nothing_until_a_full_line_arrives() {
        let mut decoder = LineDecoder::new();
        decoder.input(b"24 0");
        assert_eq!(decoder.decode_next().unwrap(), None);
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut decoder = LineDecoder::new();
        decoder.input(b"24 0");
        decoder.input(b"7\n");
        let msg = decoder.decode_next().unwrap().unwrap();
        assert_eq!(msg.code, code::RES_CONNSEN);
        assert_eq!(msg.payload, "07");
    }

    #[test]
    fn decodes_multiple_messages_from_one_read() {
        let mut decoder = LineDecoder::new();
        decoder.input(b"0 01\n255 10\n");

        let first = decoder.decode_next().unwrap().unwrap();
        assert_eq!(first.code, code::OK);
        let second = decoder.decode_next().unwrap().unwrap();
        assert_eq!(second.code, code::ERROR);
        assert_eq!(decoder.decode_next().unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut decoder = LineDecoder::new();
        decoder.input(&vec![b'9'; MAX_MESSAGE_LEN + 10]);
        decoder.input(b"\n");
        assert!(decoder.decode_next().is_err());
    }
}
