//! Binary wire primitives
//!
//! Every persistent and on-the-wire binary format in the core uses the same
//! conventions: big-endian integers, u32-length-prefixed UTF-8 strings,
//! u32-count-prefixed arrays and maps. The action cache and checkpoint
//! files share these primitives with the distributed protocol.

use crate::error::BuildError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on any single length prefix, to stop a corrupt frame from
/// driving an allocation
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Wire-level codec failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The stream ended inside a value
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),

    /// A string field held invalid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A length prefix exceeded the frame bound
    #[error("length prefix {0} exceeds frame bound")]
    LengthOverflow(u32),

    /// The message type byte is not in the protocol
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// The compression tag is not in the protocol
    #[error("unknown compression tag {0}")]
    UnknownCompression(u8),

    /// The compression tag is valid but this build cannot decode it
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(&'static str),

    /// A file or frame magic did not match
    #[error("bad magic, expected {expected}")]
    BadMagic {
        /// The magic we were looking for
        expected: &'static str,
    },

    /// The format version is not one we speak
    #[error("unsupported version {found}, expected {expected}")]
    VersionMismatch {
        /// Version we implement
        expected: u8,
        /// Version found in the data
        found: u8,
    },

    /// Underlying I/O failure
    #[error("wire I/O failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::UnexpectedEof(err.to_string()),
            _ => WireError::Io(err.to_string()),
        }
    }
}

impl From<WireError> for BuildError {
    fn from(err: WireError) -> Self {
        BuildError::Protocol(err.to_string())
    }
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;

/// Write a u32-length-prefixed UTF-8 string
pub fn write_string<W: Write>(w: &mut W, s: &str) -> WireResult<()> {
    let bytes = s.as_bytes();
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read a u32-length-prefixed UTF-8 string
pub fn read_string<R: Read>(r: &mut R) -> WireResult<String> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::LengthOverflow(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| WireError::InvalidUtf8)
}

/// Write a u32-length-prefixed byte blob
pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> WireResult<()> {
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read a u32-length-prefixed byte blob
pub fn read_bytes<R: Read>(r: &mut R) -> WireResult<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::LengthOverflow(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a u32-count-prefixed array of strings
pub fn write_string_list<W: Write, S: AsRef<str>>(w: &mut W, items: &[S]) -> WireResult<()> {
    w.write_u32::<BigEndian>(items.len() as u32)?;
    for item in items {
        write_string(w, item.as_ref())?;
    }
    Ok(())
}

/// Read a u32-count-prefixed array of strings
pub fn read_string_list<R: Read>(r: &mut R) -> WireResult<Vec<String>> {
    let count = r.read_u32::<BigEndian>()?;
    if count > MAX_FRAME_LEN {
        return Err(WireError::LengthOverflow(count));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read_string(r)?);
    }
    Ok(items)
}

/// Write a u32-count-prefixed string-to-string map, sorted by key so the
/// encoding of a given map is canonical
pub fn write_string_map<W: Write>(w: &mut W, map: &HashMap<String, String>) -> WireResult<()> {
    w.write_u32::<BigEndian>(map.len() as u32)?;
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();
    for key in keys {
        write_string(w, key)?;
        write_string(w, &map[key])?;
    }
    Ok(())
}

/// Read a u32-count-prefixed string-to-string map
pub fn read_string_map<R: Read>(r: &mut R) -> WireResult<HashMap<String, String>> {
    let count = r.read_u32::<BigEndian>()?;
    if count > MAX_FRAME_LEN {
        return Err(WireError::LengthOverflow(count));
    }
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_string(r)?;
        let value = read_string(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "//app:main").unwrap();
        let back = read_string(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back, "//app:main");
    }

    #[test]
    fn test_empty_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert_eq!(read_string(&mut Cursor::new(&buf)).unwrap(), "");
    }

    #[test]
    fn test_list_round_trip() {
        let items = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
        let mut buf = Vec::new();
        write_string_list(&mut buf, &items).unwrap();
        assert_eq!(read_string_list(&mut Cursor::new(&buf)).unwrap(), items);
    }

    #[test]
    fn test_map_round_trip_and_canonical_order() {
        let mut map = HashMap::new();
        map.insert("zeta".to_string(), "1".to_string());
        map.insert("alpha".to_string(), "2".to_string());

        let mut first = Vec::new();
        write_string_map(&mut first, &map).unwrap();
        let mut second = Vec::new();
        write_string_map(&mut second, &map).unwrap();
        assert_eq!(first, second);

        let back = read_string_map(&mut Cursor::new(&first)).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_truncated_string_is_eof() {
        let mut buf = Vec::new();
        write_string(&mut buf, "full value").unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            read_string(&mut Cursor::new(&buf)),
            Err(WireError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_hostile_length_rejected() {
        let buf = [0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            read_string(&mut Cursor::new(&buf)),
            Err(WireError::LengthOverflow(_))
        ));
    }
}
