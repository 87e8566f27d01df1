//! Frame codec
//!
//! ```text
//! offset 0: u32 magic   = 0xDEADBEEF
//! offset 4: u32 length  (1 ..= 8 MiB)
//! offset 8: length bytes of envelope payload
//! ```
//!
//! Both header fields are big-endian. Decoding is incremental and lives in
//! [`crate::stream::scanner`]; this module only knows the header layout.

use crate::error::ProxyError;
use crate::protocol::envelope::Envelope;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

/// Frame magic number
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Header size (magic + length)
pub const HEADER_LEN: usize = 8;

/// Maximum frame body (8 MiB)
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// Size on the wire of a frame carrying `body_len` bytes.
pub const fn encoded_len(body_len: usize) -> usize {
    HEADER_LEN + body_len
}

/// Encode `body` as a complete frame.
///
/// # Panics
///
/// Panics if `body` is empty or longer than [`MAX_BODY_LEN`]. Callers only
/// frame envelopes, which are never empty and far below the cap.
pub fn encode(body: &[u8]) -> Bytes {
    assert!(
        !body.is_empty() && body.len() <= MAX_BODY_LEN,
        "frame body length {} outside 1..={}",
        body.len(),
        MAX_BODY_LEN
    );

    let mut header = [0u8; HEADER_LEN];
    BigEndian::write_u32(&mut header[0..4], MAGIC);
    BigEndian::write_u32(&mut header[4..8], body.len() as u32);

    let mut frame = BytesMut::with_capacity(encoded_len(body.len()));
    frame.put_slice(&header);
    frame.put_slice(body);
    frame.freeze()
}

/// Encode an envelope and frame it.
pub fn encode_envelope<E: Envelope>(envelope: &E) -> Bytes {
    encode(&envelope.to_bytes())
}

/// Validate a frame header and return the body length it announces.
pub fn parse_header(header: &[u8]) -> Result<usize, ProxyError> {
    if header.len() < HEADER_LEN {
        return Err(ProxyError::Frame(format!(
            "Header too short: {} < {}",
            header.len(),
            HEADER_LEN
        )));
    }

    let magic = BigEndian::read_u32(&header[0..4]);
    if magic != MAGIC {
        return Err(ProxyError::Frame(format!("Bad magic: 0x{:08x}", magic)));
    }

    // The length travels as an unsigned word but peers treat it as a signed
    // int, so anything with the top bit set is already illegal.
    let length = BigEndian::read_u32(&header[4..8]) as usize;
    if length == 0 || length > MAX_BODY_LEN {
        return Err(ProxyError::Frame(format!(
            "Illegal body length: {} (allowed 1..={})",
            length, MAX_BODY_LEN
        )));
    }

    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_hello() {
        let frame = encode(b"hello");
        assert_eq!(
            &frame[..],
            &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']
        );
        assert_eq!(frame.len(), encoded_len(5));
    }

    #[test]
    fn test_parse_header_accepts_cap() {
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], MAGIC);
        BigEndian::write_u32(&mut header[4..8], MAX_BODY_LEN as u32);
        assert_eq!(parse_header(&header).unwrap(), MAX_BODY_LEN);
    }

    #[test]
    fn test_parse_header_rejects_cap_plus_one() {
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], MAGIC);
        BigEndian::write_u32(&mut header[4..8], MAX_BODY_LEN as u32 + 1);
        assert!(matches!(parse_header(&header), Err(ProxyError::Frame(_))));
    }

    #[test]
    fn test_parse_header_rejects_zero_length() {
        let header = [0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0];
        assert!(matches!(parse_header(&header), Err(ProxyError::Frame(_))));
    }

    #[test]
    fn test_parse_header_rejects_negative_length() {
        let header = [0xDE, 0xAD, 0xBE, 0xEF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(parse_header(&header), Err(ProxyError::Frame(_))));
    }

    #[test]
    fn test_encode_max_body() {
        let body = vec![0x5Au8; MAX_BODY_LEN];
        let frame = encode(&body);
        assert_eq!(parse_header(&frame).unwrap(), MAX_BODY_LEN);
        assert_eq!(&frame[HEADER_LEN..], &body[..]);
    }

    #[test]
    #[should_panic]
    fn test_encode_oversized_panics() {
        let body = vec![0u8; MAX_BODY_LEN + 1];
        let _ = encode(&body);
    }

    #[test]
    #[should_panic]
    fn test_encode_empty_panics() {
        let _ = encode(&[]);
    }

    proptest! {
        #[test]
        fn test_header_roundtrip(body in prop::collection::vec(any::<u8>(), 1..4096)) {
            let frame = encode(&body);
            prop_assert_eq!(parse_header(&frame).unwrap(), body.len());
            prop_assert_eq!(&frame[HEADER_LEN..], &body[..]);
        }

        #[test]
        fn test_bad_magic_rejected(
            magic in any::<u32>().prop_filter("must differ from MAGIC", |m| *m != MAGIC),
            length in any::<u32>(),
            tail in prop::collection::vec(any::<u8>(), 0..64)
        ) {
            let mut data = vec![0u8; HEADER_LEN];
            BigEndian::write_u32(&mut data[0..4], magic);
            BigEndian::write_u32(&mut data[4..8], length);
            data.extend_from_slice(&tail);
            prop_assert!(matches!(parse_header(&data), Err(ProxyError::Frame(_))));
        }

        #[test]
        fn test_illegal_length_rejected(
            length in prop_oneof![Just(0u32), (MAX_BODY_LEN as u32 + 1)..=u32::MAX],
            tail in prop::collection::vec(any::<u8>(), 0..64)
        ) {
            let mut data = vec![0u8; HEADER_LEN];
            BigEndian::write_u32(&mut data[0..4], MAGIC);
            BigEndian::write_u32(&mut data[4..8], length);
            data.extend_from_slice(&tail);
            prop_assert!(matches!(parse_header(&data), Err(ProxyError::Frame(_))));
        }
    }
}
