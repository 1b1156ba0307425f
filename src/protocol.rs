//! Terminator-delimited framing shared by the relay server, posers and drivers.
//!
//! Self-contained: no imports from other hobo_vr modules.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

pub const DEFAULT_TERMINATOR: &[u8] = b"\n";
/// Relay read budget per chunk.
pub const DEFAULT_READ_BUDGET: usize = 400;
/// Largest message a poser or driver accepts.
pub const CLIENT_MAX_FRAME: usize = 64 * 1024;

/// Splits a byte stream on an arbitrary (possibly multi-byte) terminator.
///
/// In the default mode frames are yielded without the terminator and the
/// encoder appends it. In passthrough mode (used by the relay) frames keep
/// their terminator and the encoder writes bytes verbatim, so a relayed stream
/// is byte-identical to what the sender wrote.
///
/// A run of `max_length` bytes with no terminator in sight is yielded as its
/// own unterminated chunk; trailing bytes at EOF are yielded as a final chunk.
#[derive(Debug, Clone)]
pub struct TerminatorCodec {
    terminator: Vec<u8>,
    max_length: usize,
    passthrough: bool,
}

impl TerminatorCodec {
    pub fn new(terminator: impl Into<Vec<u8>>, max_length: usize) -> Self {
        let mut terminator = terminator.into();
        if terminator.is_empty() {
            terminator = DEFAULT_TERMINATOR.to_vec();
        }
        Self {
            terminator,
            max_length: max_length.max(1),
            passthrough: false,
        }
    }

    pub fn passthrough(terminator: impl Into<Vec<u8>>, max_length: usize) -> Self {
        Self {
            passthrough: true,
            ..Self::new(terminator, max_length)
        }
    }

    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Message content of a frame: terminator and surrounding ASCII whitespace removed.
    pub fn content<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        frame
            .strip_suffix(self.terminator.as_slice())
            .unwrap_or(frame)
            .trim_ascii()
    }
}

impl Default for TerminatorCodec {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATOR, CLIENT_MAX_FRAME)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Decoder for TerminatorCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        let t = self.terminator.len();
        let window = src.len().min(self.max_length + t);
        if let Some(pos) = find(&src[..window], &self.terminator) {
            if self.passthrough {
                return Ok(Some(src.split_to(pos + t).freeze()));
            }
            let frame = src.split_to(pos);
            src.advance(t);
            return Ok(Some(frame.freeze()));
        }
        if src.len() >= self.max_length + t {
            return Ok(Some(src.split_to(self.max_length).freeze()));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }
}

impl Encoder<Bytes> for TerminatorCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.len() + self.terminator.len());
        dst.put(item);
        if !self.passthrough {
            dst.put_slice(&self.terminator);
        }
        Ok(())
    }
}

pub type MessageStream = Framed<TcpStream, TerminatorCodec>;

/// Create a framed message stream with terminator framing.
pub fn message_stream(stream: TcpStream, codec: TerminatorCodec) -> MessageStream {
    Framed::new(stream, codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut TerminatorCodec, input: &[u8]) -> Vec<Bytes> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        while let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_newline_frames() {
        let mut codec = TerminatorCodec::default();
        let frames = decode_all(&mut codec, b"hello\n1 2 3\n\n");
        assert_eq!(frames, vec![&b"hello"[..], &b"1 2 3"[..], &b""[..]]);
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = TerminatorCodec::default();
        let mut buf = BytesMut::from(&b"hol"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"la\nrest");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"holla"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap(), &b"rest"[..]);
    }

    #[test]
    fn test_multibyte_terminator_split_across_reads() {
        let mut codec = TerminatorCodec::new(b"\t\r\n".to_vec(), 64);
        let mut buf = BytesMut::from(&b"abc\t\r"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\ndef\t\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"abc"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"def"[..]);
    }

    #[test]
    fn test_overlong_run_is_chunked() {
        let mut codec = TerminatorCodec::new(b"\n".to_vec(), 4);
        let frames = decode_all(&mut codec, b"abcdefgh\nxy\n");
        assert_eq!(frames, vec![&b"abcd"[..], &b"efgh"[..], &b"xy"[..]]);
    }

    #[test]
    fn test_passthrough_keeps_bytes() {
        let mut codec = TerminatorCodec::passthrough(b"\n".to_vec(), 4);
        let frames = decode_all(&mut codec, b"abcdefg\nxy\ntail");
        assert_eq!(frames, vec![&b"abcd"[..], &b"efg\n"[..], &b"xy\n"[..], &b"tail"[..]]);

        let mut joined = BytesMut::new();
        for f in frames {
            codec.encode(f, &mut joined).unwrap();
        }
        assert_eq!(&joined[..], b"abcdefg\nxy\ntail");
    }

    #[test]
    fn test_content_strips_terminator() {
        let codec = TerminatorCodec::passthrough(b"\t\r\n".to_vec(), 400);
        assert_eq!(codec.content(b"CLOSE\t\r\n"), b"CLOSE");
        assert_eq!(codec.content(b" holla "), b"holla");
        let codec = TerminatorCodec::new(b"END".to_vec(), 400);
        assert_eq!(codec.content(b"helloEND"), b"hello");
    }

    #[test]
    fn test_encode_appends_terminator() {
        let mut codec = TerminatorCodec::new(b"\r\n".to_vec(), 16);
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"CLOSE"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"CLOSE\r\n");
    }

    #[test]
    fn test_empty_terminator_falls_back() {
        let codec = TerminatorCodec::new(Vec::new(), 0);
        assert_eq!(codec.terminator(), b"\n");
        assert_eq!(codec.max_length(), 1);
    }
}
