//! The fixed-size integrity header prefixed to every record file.
//!
//! Both catalog record files and materialized file bodies carry this header
//! so that a stray or truncated file is detected before its payload is
//! trusted. Logical byte 0 of the payload starts immediately after the
//! header.

use crate::inode::InodeNumber;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Total header size in bytes. The payload starts at this offset.
pub const HEADER_LENGTH: usize = 64;

/// Header format version.
pub const HEADER_VERSION: u32 = 1;

/// Identifier for a directory record file.
pub const HEADER_ID_DIR: [u8; 4] = *b"OVDR";

/// Identifier for a materialized file body.
pub const HEADER_ID_FILE: [u8; 4] = *b"OVFL";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Parsed view of an on-disk header. Fields are raw and unvalidated until
/// [`Header::check`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: [u8; 4],
    pub version: u32,
    pub inode: u64,
}

impl Header {
    pub fn new(id: [u8; 4], inode: InodeNumber) -> Header {
        Header {
            id,
            version: HEADER_VERSION,
            inode: inode.get(),
        }
    }

    /// Serializes the header: identifier, big-endian version, big-endian
    /// inode number, zero fill to [`HEADER_LENGTH`].
    pub fn serialize(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        out[0..4].copy_from_slice(&self.id);
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..16].copy_from_slice(&self.inode.to_be_bytes());
        out
    }

    /// Parses a header from the first [`HEADER_LENGTH`] bytes of a record
    /// file. Fails only on short input; field validation is separate.
    pub fn parse(bytes: &[u8]) -> Result<Header, String> {
        if bytes.len() < HEADER_LENGTH {
            return Err(format!(
                "file was too short to contain overlay header: read {} bytes, expected {} bytes",
                bytes.len(),
                HEADER_LENGTH
            ));
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[0..4]);
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let inode = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        Ok(Header { id, version, inode })
    }

    /// Validates the parsed header against the expected identifier and the
    /// inode number the record is stored under.
    pub fn check(&self, expected_id: [u8; 4], inode: InodeNumber) -> Result<(), String> {
        if self.version != HEADER_VERSION {
            return Err(format!(
                "unknown overlay file format version {}",
                self.version
            ));
        }
        if self.id != expected_id {
            return Err(format!(
                "unexpected overlay header identifier: expected {:?}, found {:?}",
                String::from_utf8_lossy(&expected_id),
                String::from_utf8_lossy(&self.id),
            ));
        }
        if self.inode != inode.get() {
            return Err(format!(
                "overlay header inode mismatch: expected {}, found {}",
                inode, self.inode
            ));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let header = Header::new(HEADER_ID_FILE, InodeNumber::new(42));
        let bytes = header.serialize();
        assert_eq!(bytes.len(), HEADER_LENGTH);
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        parsed.check(HEADER_ID_FILE, InodeNumber::new(42)).unwrap();
    }

    #[test]
    fn test_reserved_area_is_zeroed() {
        let bytes = Header::new(HEADER_ID_DIR, InodeNumber::new(7)).serialize();
        assert!(bytes[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_header() {
        let err = Header::parse(&[0u8; 10]).unwrap_err();
        assert!(err.contains("too short"));
        assert!(err.contains("read 10 bytes"));
    }

    #[test]
    fn test_garbage_header_reports_version() {
        // A header overwritten with 0x55 everywhere fails on the version
        // field first, matching what the consistency checker reports.
        let parsed = Header::parse(&[0x55u8; HEADER_LENGTH]).unwrap();
        let err = parsed.check(HEADER_ID_FILE, InodeNumber::new(5)).unwrap_err();
        assert_eq!(
            err,
            format!("unknown overlay file format version {}", 0x55555555u32)
        );
    }

    #[test]
    fn test_identifier_mismatch() {
        let header = Header::new(HEADER_ID_DIR, InodeNumber::new(5));
        let err = header.check(HEADER_ID_FILE, InodeNumber::new(5)).unwrap_err();
        assert!(err.contains("identifier"));
    }

    #[test]
    fn test_inode_mismatch() {
        let header = Header::new(HEADER_ID_FILE, InodeNumber::new(5));
        let err = header.check(HEADER_ID_FILE, InodeNumber::new(6)).unwrap_err();
        assert!(err.contains("inode mismatch"));
    }
}
