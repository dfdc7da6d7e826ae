//! Length-prefixed framing of direct messages.
//!
//! Each message is sent as an unsigned LEB128 varint byte length followed by
//! the UTF-8 bytes of the text. The receiver answers every frame with the
//! single byte [`ACK_BYTE`].

use crate::transport::ProtocolStream;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rosenet_types::{RoseNetError, RoseNetResult};

/// The only valid acknowledgement byte.
pub const ACK_BYTE: u8 = 1;

/// A u64 never needs more than ten 7-bit groups.
const MAX_VARINT_LEN: usize = 10;

/// Append `value` as an unsigned LEB128 varint.
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode a varint from the front of `data`.
///
/// Returns `(value, bytes_consumed)`, or `None` if `data` ends before the
/// varint does.
pub fn decode_varint(data: &[u8]) -> RoseNetResult<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(RoseNetError::InvalidFrame(
                "length prefix longer than 10 bytes".into(),
            ));
        }
        // The tenth group only has room for bit 63.
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(RoseNetError::InvalidFrame(
                "length prefix overflows u64".into(),
            ));
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    Ok(None)
}

/// Frame one text message.
pub fn encode(message: &str) -> Bytes {
    let payload = message.as_bytes();
    let mut buf = BytesMut::with_capacity(payload.len() + MAX_VARINT_LEN);
    encode_varint(payload.len() as u64, &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental decoder that reassembles frames from arbitrarily split chunks.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Whether no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete message, if one is buffered.
    pub fn decode_next(&mut self) -> RoseNetResult<Option<String>> {
        let Some((len, prefix_len)) = decode_varint(&self.buf)? else {
            return Ok(None);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > self.max_message_size {
            return Err(RoseNetError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        if self.buf.len() < prefix_len + len {
            return Ok(None);
        }
        self.buf.advance(prefix_len);
        let payload = self.buf.split_to(len);
        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| RoseNetError::InvalidUtf8)
    }
}

/// Read chunks from `stream` until one full message is decoded.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_message(
    stream: &dyn ProtocolStream,
    decoder: &mut MessageDecoder,
) -> RoseNetResult<Option<String>> {
    loop {
        if let Some(message) = decoder.decode_next()? {
            return Ok(Some(message));
        }
        match stream.read().await? {
            Some(chunk) => decoder.push(&chunk),
            None if decoder.is_empty() => return Ok(None),
            None => {
                return Err(RoseNetError::InvalidFrame(
                    "stream ended inside a frame".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_known_vectors() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (16_384, &[0x80, 0x80, 0x01]),
        ];
        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            encode_varint(*value, &mut buf);
            assert_eq!(&buf[..], *expected, "encoding {value}");
            assert_eq!(
                decode_varint(expected).unwrap(),
                Some((*value, expected.len()))
            );
        }
    }

    #[test]
    fn test_encode_hello_world() {
        let frame = encode("hello world");
        assert_eq!(frame[0], 11);
        assert_eq!(&frame[1..], b"hello world");
    }

    #[test]
    fn test_encode_empty_message() {
        assert_eq!(&encode("")[..], &[0x00]);
        let mut decoder = MessageDecoder::new(16);
        decoder.push(&[0x00]);
        assert_eq!(decoder.decode_next().unwrap(), Some(String::new()));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let long = "x".repeat(200);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode("first"));
        wire.extend_from_slice(&encode(&long));

        let mut decoder = MessageDecoder::new(1024);
        // Feed one byte at a time; the varint of the second frame spans two bytes.
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            decoder.push(&[*byte]);
            while let Some(message) = decoder.decode_next().unwrap() {
                decoded.push(message);
            }
        }
        assert_eq!(decoded, vec!["first".to_string(), long]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_multibyte_utf8_length_is_in_bytes() {
        let frame = encode("héllo");
        assert_eq!(frame[0], 6);
        let mut decoder = MessageDecoder::new(64);
        decoder.push(&frame);
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some("héllo"));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = MessageDecoder::new(4);
        decoder.push(&encode("too long"));
        assert!(matches!(
            decoder.decode_next(),
            Err(RoseNetError::MessageTooLarge { size: 8, max: 4 })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut decoder = MessageDecoder::new(64);
        decoder.push(&[0x02, 0xC3, 0x28]);
        assert!(matches!(
            decoder.decode_next(),
            Err(RoseNetError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_tenth_varint_byte_limited_to_one_bit() {
        let mut max = [0xFFu8; 10];
        max[9] = 0x01;
        assert_eq!(decode_varint(&max).unwrap(), Some((u64::MAX, 10)));

        let mut buf = BytesMut::new();
        encode_varint(u64::MAX, &mut buf);
        assert_eq!(&buf[..], &max[..]);

        let mut overflow = [0xFFu8; 10];
        overflow[9] = 0x02;
        assert!(matches!(
            decode_varint(&overflow),
            Err(RoseNetError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_generated_messages_survive_framing() {
        use rand::seq::SliceRandom;
        use rand::Rng;

        const ALPHABET: &[char] = &['a', 'Z', '7', ' ', '~', 'é', 'ß', 'Ж', '中', '✓', '🦀'];
        let mut rng = rand::thread_rng();

        // Plain ASCII around the one-byte/two-byte prefix boundary, then
        // random mixed-width text.
        let mut messages: Vec<String> = (120..=136).map(|len| "x".repeat(len)).collect();
        for _ in 0..200 {
            let chars = rng.gen_range(0..300);
            messages.push(
                (0..chars)
                    .map(|_| *ALPHABET.choose(&mut rng).unwrap())
                    .collect(),
            );
        }

        for message in &messages {
            let frame = encode(message);
            let prefix_len = if message.len() < 128 { 1 } else { 2 };
            assert_eq!(frame.len(), prefix_len + message.len());

            let mut decoder = MessageDecoder::new(4_096);
            let mut rest = &frame[..];
            let mut decoded = None;
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len());
                decoder.push(&rest[..take]);
                rest = &rest[take..];
                if let Some(out) = decoder.decode_next().unwrap() {
                    decoded = Some(out);
                }
            }
            assert_eq!(decoded.as_ref(), Some(message));
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let data = [0xFFu8; 11];
        assert!(matches!(
            decode_varint(&data),
            Err(RoseNetError::InvalidFrame(_))
        ));
    }
}
