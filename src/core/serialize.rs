// Binary encoding shared by hashing, storage and the wire protocol
//
// Integers are little-endian. Lengths and counts use the compact VarInt
// format (1, 3, 5 or 9 bytes).

use std::io::{Cursor, Read};

use chrono::{DateTime, Utc};

use crate::core::{Hash, HASH_SIZE};
use crate::error::ProtocolError;

/// Upper bound for any length prefix read from untrusted input
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Types with a canonical byte encoding
pub trait Serializable: Sized {
    fn encode(&self, buf: &mut Vec<u8>);

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError>;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode a value that must span all of `data`
    fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(data);
        let value = Self::decode(&mut cursor)?;
        if cursor.position() as usize != data.len() {
            return Err(ProtocolError::InvalidMessage(format!(
                "{} trailing bytes",
                data.len() - cursor.position() as usize
            )));
        }
        Ok(value)
    }
}

/// A count for a fixed 4-byte field, saturating at `u32::MAX`.
///
/// Collections that fit in a `MAX_PAYLOAD_SIZE` frame never reach the cap.
pub fn count_u32(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Write a variable-length integer (VarInt)
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffffffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Read a variable-length integer (VarInt)
pub fn read_varint(reader: &mut dyn Read) -> Result<u64, ProtocolError> {
    match read_u8(reader)? {
        0xfd => Ok(read_u16(reader)? as u64),
        0xfe => Ok(read_u32(reader)? as u64),
        0xff => read_u64(reader),
        small => Ok(small as u64),
    }
}

/// Number of extra bytes following a VarInt prefix byte
pub fn varint_tail_len(prefix: u8) -> usize {
    match prefix {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        _ => 0,
    }
}

/// Read a VarInt length and reject anything above `MAX_PAYLOAD_SIZE`
pub fn read_length(reader: &mut dyn Read) -> Result<usize, ProtocolError> {
    let len = read_varint(reader)?;
    if len > MAX_PAYLOAD_SIZE as u64 {
        return Err(ProtocolError::PayloadTooLarge { size: len, max: MAX_PAYLOAD_SIZE });
    }
    Ok(len as usize)
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read bytes with length prefix
pub fn read_var_bytes(reader: &mut dyn Read) -> Result<Vec<u8>, ProtocolError> {
    let len = read_length(reader)?;
    let mut data = Vec::new();
    (&mut *reader).take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(ProtocolError::Truncated);
    }
    Ok(data)
}

pub fn write_var_str(buf: &mut Vec<u8>, value: &str) {
    write_var_bytes(buf, value.as_bytes());
}

pub fn read_var_str(reader: &mut dyn Read) -> Result<String, ProtocolError> {
    String::from_utf8(read_var_bytes(reader)?)
        .map_err(|_| ProtocolError::InvalidMessage("string is not utf-8".to_string()))
}

pub fn write_hash(buf: &mut Vec<u8>, hash: &Hash) {
    buf.extend_from_slice(hash.as_bytes());
}

pub fn read_hash(reader: &mut dyn Read) -> Result<Hash, ProtocolError> {
    let mut bytes = [0u8; HASH_SIZE];
    reader.read_exact(&mut bytes)?;
    Ok(Hash(bytes))
}

/// Timestamps travel as signed milliseconds since the Unix epoch
pub fn write_timestamp(buf: &mut Vec<u8>, timestamp: &DateTime<Utc>) {
    buf.extend_from_slice(&timestamp.timestamp_millis().to_le_bytes());
}

pub fn read_timestamp(reader: &mut dyn Read) -> Result<DateTime<Utc>, ProtocolError> {
    let millis = read_u64(reader)? as i64;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| ProtocolError::InvalidMessage(format!("timestamp {millis} out of range")))
}

/// Optional values carry a one byte presence flag
pub fn read_flag(reader: &mut dyn Read) -> Result<bool, ProtocolError> {
    match read_u8(reader)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidMessage(format!("invalid flag byte {other}"))),
    }
}

pub fn read_u8(reader: &mut dyn Read) -> Result<u8, ProtocolError> {
    let mut bytes = [0u8; 1];
    reader.read_exact(&mut bytes)?;
    Ok(bytes[0])
}

pub fn read_u16(reader: &mut dyn Read) -> Result<u16, ProtocolError> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

pub fn read_u32(reader: &mut dyn Read) -> Result<u32, ProtocolError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn read_u64(reader: &mut dyn Read) -> Result<u64, ProtocolError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn read_code(reader: &mut dyn Read) -> Result<[u8; 4], ProtocolError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Encode a counted sequence
pub fn write_list<T: Serializable>(buf: &mut Vec<u8>, items: &[T]) {
    write_varint(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

/// Decode a counted sequence. The count is not trusted for preallocation.
pub fn read_list<T: Serializable>(reader: &mut dyn Read) -> Result<Vec<T>, ProtocolError> {
    let count = read_length(reader)?;
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(T::decode(reader)?);
    }
    Ok(items)
}

impl Serializable for Hash {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_hash(buf, self);
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        read_hash(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_u32_saturates() {
        assert_eq!(count_u32(0), 0);
        assert_eq!(count_u32(500), 500);
        assert_eq!(count_u32(u32::MAX as usize), u32::MAX);
        assert_eq!(count_u32(usize::MAX), u32::MAX);
    }

    #[test]
    fn test_varint_small() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100);
        assert_eq!(buf, vec![100]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_varint(&mut cursor).unwrap(), 100);
    }

    #[test]
    fn test_varint_widths() {
        let cases = [(0xfc_u64, 1usize), (1000, 3), (100_000, 5), (u64::MAX, 9)];
        for (value, width) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), width, "width of {value}");
            assert_eq!(varint_tail_len(buf[0]), width - 1);
            assert_eq!(read_varint(&mut Cursor::new(buf)).unwrap(), value);
        }
    }

    #[test]
    fn test_var_bytes() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"hello world");

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_var_bytes(&mut cursor).unwrap(), b"hello world");
    }

    #[test]
    fn test_var_bytes_truncated() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"hello world");
        buf.truncate(5);

        let err = read_var_bytes(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated);
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX);

        let err = read_var_bytes(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_timestamp_keeps_milliseconds() {
        let timestamp = DateTime::from_timestamp_millis(1_625_616_000_123).unwrap();
        let mut buf = Vec::new();
        write_timestamp(&mut buf, &timestamp);
        assert_eq!(buf.len(), 8);
        assert_eq!(read_timestamp(&mut Cursor::new(buf)).unwrap(), timestamp);
    }

    #[test]
    fn test_invalid_flag() {
        let err = read_flag(&mut Cursor::new(vec![7u8])).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut buf = Hash::zero().serialize();
        buf.push(0);
        assert!(matches!(Hash::deserialize(&buf), Err(ProtocolError::InvalidMessage(_))));
    }
}
