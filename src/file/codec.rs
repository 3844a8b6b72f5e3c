//! Record framing for spilled events
//!
//! # Record Format
//!
//! ```text
//! [2 bytes: magic 0xCB 0xD0]
//! [4 bytes: event type    (big-endian)]
//! [4 bytes: source id     (big-endian)]
//! [4 bytes: destination id(big-endian)]
//! [4 bytes: payload length(big-endian)]
//! [4 bytes: CRC32 of the 16 bytes above (big-endian)]
//! [N bytes: payload]
//! ```
//!
//! The payload is the event's opaque serialized form. A record whose magic is
//! wrong, whose header checksum does not match or whose length is implausible
//! is corruption: the decoder skips forward to the next magic and reports how
//! many bytes it dropped. A damaged length therefore costs one record, never
//! the rest of the file.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

use crate::io::Event;

/// Marker opening every record
pub const RECORD_MAGIC: [u8; 2] = [0xCB, 0xD0];

/// Size of the fixed record header in bytes
pub const HEADER_SIZE: usize = 22;

/// Offset of the header checksum, also the size of the checksummed fields
const CRC_OFFSET: usize = 18;

/// Largest payload accepted when decoding
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Result of one decode attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete record was consumed
    Event(Event),
    /// More bytes are needed
    Incomplete,
    /// Garbage was dropped from the front of the buffer
    Corrupted { skipped: usize },
}

/// Append the record of `event` to `dst`
pub fn encode(event: &Event, dst: &mut BytesMut) {
    let data = event.data();
    dst.reserve(HEADER_SIZE + data.len());
    dst.put_slice(&RECORD_MAGIC);
    dst.put_u32(event.type_id());
    dst.put_u32(event.source_id());
    dst.put_u32(event.destination_id());
    dst.put_u32(data.len() as u32);
    let crc = header_crc(&dst[dst.len() - (CRC_OFFSET - RECORD_MAGIC.len())..]);
    dst.put_u32(crc);
    dst.put_slice(data);
}

/// Encoded size of `event`
pub fn encoded_len(event: &Event) -> usize {
    HEADER_SIZE + event.data().len()
}

/// Try to take one record from the front of `src`
pub fn decode(src: &mut BytesMut) -> Decoded {
    if src.is_empty() {
        return Decoded::Incomplete;
    }

    let magic_len = src.len().min(RECORD_MAGIC.len());
    if src[..magic_len] != RECORD_MAGIC[..magic_len] {
        let skipped = skip_to_magic(src, 1);
        return Decoded::Corrupted { skipped };
    }

    if src.len() < HEADER_SIZE {
        return Decoded::Incomplete;
    }

    let mut header = &src[RECORD_MAGIC.len()..HEADER_SIZE];
    let event_type = header.get_u32();
    let source_id = header.get_u32();
    let destination_id = header.get_u32();
    let len = header.get_u32() as usize;
    let crc = header.get_u32();

    if crc != header_crc(&src[RECORD_MAGIC.len()..CRC_OFFSET]) || len > MAX_PAYLOAD_SIZE {
        let skipped = skip_to_magic(src, 1);
        return Decoded::Corrupted { skipped };
    }

    if src.len() < HEADER_SIZE + len {
        return Decoded::Incomplete;
    }

    src.advance(HEADER_SIZE);
    let data = src.split_to(len).freeze();
    Decoded::Event(
        Event::new(event_type, data)
            .with_source(source_id)
            .with_destination(destination_id),
    )
}

fn header_crc(fields: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(fields);
    hasher.finalize()
}

/// Drop bytes until a (possibly partial) magic starts the buffer
fn skip_to_magic(src: &mut BytesMut, from: usize) -> usize {
    let len = src.len();
    let mut pos = from.min(len);
    while pos < len {
        if src[pos] == RECORD_MAGIC[0] && (pos + 1 == len || src[pos + 1] == RECORD_MAGIC[1]) {
            break;
        }
        pos += 1;
    }
    src.advance(pos);
    pos
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn sample(i: u8) -> Event {
        Event::new(0x10001, Bytes::from(vec![i; 5]))
            .with_source(7)
            .with_destination(9)
    }

    #[test]
    fn test_decode_needs_whole_record() {
        let mut full = BytesMut::new();
        encode(&sample(1), &mut full);
        assert_eq!(full.len(), encoded_len(&sample(1)));

        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 2]);
        assert_eq!(decode(&mut partial), Decoded::Incomplete);
        assert_eq!(partial.len(), HEADER_SIZE + 2);

        assert_eq!(decode(&mut full), Decoded::Event(sample(1)));
        assert!(full.is_empty());
    }

    #[test]
    fn test_garbage_is_skipped_until_next_record() {
        let mut buf = BytesMut::from(&b"junk!"[..]);
        encode(&sample(2), &mut buf);

        assert_eq!(decode(&mut buf), Decoded::Corrupted { skipped: 5 });
        assert_eq!(decode(&mut buf), Decoded::Event(sample(2)));
    }

    #[test]
    fn test_implausible_length_is_corruption() {
        let mut buf = BytesMut::new();
        buf.put_slice(&RECORD_MAGIC);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(u32::MAX);
        let crc = header_crc(&buf[RECORD_MAGIC.len()..]);
        buf.put_u32(crc);

        match decode(&mut buf) {
            Decoded::Corrupted { skipped } => assert!(skipped > 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_damaged_length_skips_one_record() {
        let mut buf = BytesMut::new();
        encode(&sample(1), &mut buf);
        let second = buf.len();
        encode(&sample(2), &mut buf);
        encode(&sample(3), &mut buf);

        // Length field of the second record now claims 4 KiB
        buf[second + 14..second + 18].copy_from_slice(&0x1000u32.to_be_bytes());

        let mut events = Vec::new();
        let mut skipped_total = 0;
        loop {
            match decode(&mut buf) {
                Decoded::Event(event) => events.push(event),
                Decoded::Corrupted { skipped } => skipped_total += skipped,
                Decoded::Incomplete => break,
            }
        }
        assert_eq!(events, vec![sample(1), sample(3)]);
        assert_eq!(skipped_total, encoded_len(&sample(2)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_magic_at_tail_is_kept() {
        let mut buf = BytesMut::from(&[0x00, 0x01, RECORD_MAGIC[0]][..]);
        assert_eq!(decode(&mut buf), Decoded::Corrupted { skipped: 2 });
        assert_eq!(&buf[..], &[RECORD_MAGIC[0]]);
        assert_eq!(decode(&mut buf), Decoded::Incomplete);
    }
}
