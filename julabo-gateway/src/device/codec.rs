//! Line codec for the controller's ASCII protocol.
//!
//! Commands go out terminated by CRLF. Replies are single ASCII lines, also
//! CRLF terminated; the terminator is stripped on decode. Non-ASCII bytes in
//! a reply are replaced rather than rejected, since a glitch on the RS-232
//! line should surface as an unparseable value, not a dead stream.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Longest reply we will buffer before giving up on finding a terminator.
const MAX_REPLY_LEN: usize = 256;

#[derive(Debug, Default)]
pub struct AsciiCodec;

impl<'a> Encoder<&'a str> for AsciiCodec {
    type Error = io::Error;

    fn encode(&mut self, command: &'a str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if !command.is_ascii() || command.contains(['\r', '\n']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("command is not a single ASCII line: {command:?}"),
            ));
        }
        dst.reserve(command.len() + 2);
        dst.put_slice(command.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl Decoder for AsciiCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_REPLY_LEN {
                src.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "reply exceeds maximum length",
                ));
            }
            return Ok(None);
        };

        let line = src.split_to(pos + 1);
        let text: String = line
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect();
        Ok(Some(text.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_crlf() {
        let mut buf = BytesMut::new();
        AsciiCodec.encode("out_sp_00 25.0", &mut buf).unwrap();
        assert_eq!(&buf[..], b"out_sp_00 25.0\r\n");
    }

    #[test]
    fn test_encode_rejects_embedded_newline() {
        let mut buf = BytesMut::new();
        assert!(AsciiCodec.encode("version\r\nstatus", &mut buf).is_err());
    }

    #[test]
    fn test_decode_waits_for_terminator() {
        let mut buf = BytesMut::from(&b"25.0"[..]);
        assert_eq!(AsciiCodec.decode(&mut buf).unwrap(), None);
        buf.put_slice(b"0\r\n01 OK\r\n");
        assert_eq!(AsciiCodec.decode(&mut buf).unwrap().as_deref(), Some("25.00"));
        assert_eq!(AsciiCodec.decode(&mut buf).unwrap().as_deref(), Some("01 OK"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_replaces_non_ascii() {
        let mut buf = BytesMut::from(&b"2\xff.0\r\n"[..]);
        assert_eq!(AsciiCodec.decode(&mut buf).unwrap().as_deref(), Some("2?.0"));
    }

    #[test]
    fn test_decode_overlong_reply() {
        let mut buf = BytesMut::from(&[b'x'; MAX_REPLY_LEN + 1][..]);
        assert!(AsciiCodec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
