//! Self-validating record envelope
//!
//! ```text
//! +----------------+
//! | Length (u32)   |  Bytes after this field (version + payload + crc)
//! +----------------+
//! | Version (u8)   |  Format version
//! +----------------+
//! | Payload        |  MessagePack-encoded record
//! +----------------+
//! | CRC32 (u32)    |  Checksum of Version + Payload
//! +----------------+
//! ```
//!
//! All integers are little-endian. A record whose length runs past the end
//! of the buffer is a torn write; a CRC mismatch is corruption. Readers
//! treat both as the end of the valid prefix.

use crate::error::LogError;
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum record size (16 MB)
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// version(1) + crc(4)
pub const MIN_RECORD_SIZE: usize = 1 + 4;

/// Current record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Encode a record with envelope and CRC32
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, LogError> {
    let payload = rmp_serde::to_vec_named(record).map_err(|e| LogError::Serialization(e.to_string()))?;

    let mut content = Vec::with_capacity(1 + payload.len());
    content.push(RECORD_FORMAT_VERSION);
    content.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&content);
    let crc = hasher.finalize();

    let total_len = content.len() + 4;
    if total_len > MAX_RECORD_SIZE {
        return Err(LogError::TooLarge {
            size: total_len,
            max: MAX_RECORD_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.extend_from_slice(&content);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Outcome of decoding one record from the front of a buffer
#[derive(Debug)]
pub enum Decoded<T> {
    /// A valid record and the bytes it consumed
    Record(T, usize),
    /// Not enough bytes for a whole record (torn tail or end of buffer)
    Incomplete,
}

/// Decode one record from the front of `data`
///
/// `offset` is only used for error reporting.
pub fn decode<T: DeserializeOwned>(data: &[u8], offset: u64) -> Result<Decoded<T>, LogError> {
    if data.len() < 4 {
        return Ok(Decoded::Incomplete);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[0..4]);
    let total_len = u32::from_le_bytes(len_bytes) as usize;

    if !(MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&total_len) {
        return Err(LogError::Corrupt {
            offset,
            message: format!("invalid record length {}", total_len),
        });
    }
    let total_bytes = 4 + total_len;
    if data.len() < total_bytes {
        return Ok(Decoded::Incomplete);
    }

    let content_end = total_bytes - 4;
    let content = &data[4..content_end];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[content_end..total_bytes]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(content);
    let actual_crc = hasher.finalize();
    if expected_crc != actual_crc {
        return Err(LogError::ChecksumMismatch {
            offset,
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    if content[0] != RECORD_FORMAT_VERSION {
        return Err(LogError::Corrupt {
            offset,
            message: format!("unknown record format version {}", content[0]),
        });
    }

    let record = rmp_serde::from_slice(&content[1..]).map_err(|e| LogError::Corrupt {
        offset,
        message: e.to_string(),
    })?;
    Ok(Decoded::Record(record, total_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    fn sample() -> Sample {
        Sample {
            id: 7,
            name: "prepare".into(),
        }
    }

    #[test]
    fn test_decode_reports_consumed_bytes() {
        let mut buf = encode(&sample()).unwrap();
        let first_len = buf.len();
        buf.extend(encode(&Sample { id: 8, name: "commit".into() }).unwrap());

        match decode::<Sample>(&buf, 0).unwrap() {
            Decoded::Record(rec, used) => {
                assert_eq!(rec, sample());
                assert_eq!(used, first_len);
            }
            Decoded::Incomplete => panic!("expected a record"),
        }
    }

    #[test]
    fn test_truncated_record_is_incomplete() {
        let buf = encode(&sample()).unwrap();
        let torn = &buf[..buf.len() - 3];
        assert!(matches!(decode::<Sample>(torn, 0).unwrap(), Decoded::Incomplete));
        assert!(matches!(decode::<Sample>(&buf[..2], 0).unwrap(), Decoded::Incomplete));
    }

    #[test]
    fn test_flipped_bit_is_detected() {
        let mut buf = encode(&sample()).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0x01;
        assert!(matches!(
            decode::<Sample>(&buf, 0),
            Err(LogError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_length_is_corrupt() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0];
        assert!(matches!(decode::<Sample>(&buf, 0), Err(LogError::Corrupt { .. })));
    }
}
