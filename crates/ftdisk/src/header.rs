//! On-disk codecs using nom
//!
//! Block data file:
//! ```text
//! FTBLOCK1
//! [version: u32]
//! [flags: u32]
//! ...block payloads, appended...
//! ```
//!
//! Translation index (`<data>.idx`), rewritten on every checkpoint:
//! ```text
//! FTIDX001
//! [count: u32]
//! count x [key: u64][offset: u64][len: u32]
//! ```
//!
//! Log segment:
//! ```text
//! FTLOG001
//! ...records: [len: u32][lsn: u64][kind: u8][payload: len bytes][crc32: u32]...
//! ```

use crc::{Crc, CRC_32_ISCSI};
use nom::{
    bytes::complete::{tag, take},
    multi::length_count,
    number::complete::{le_u32, le_u64, le_u8},
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};

/// Magic header for block data files
pub const BLOCK_MAGIC: &[u8] = b"FTBLOCK1";

/// Magic header for translation index files
pub const IDX_MAGIC: &[u8] = b"FTIDX001";

/// Magic header for log segments
pub const LOG_MAGIC: &[u8] = b"FTLOG001";

/// Size of the block data file header
pub const HEADER_LEN: usize = 16;

/// Bytes of framing around each log record payload
pub const RECORD_OVERHEAD: usize = 4 + 8 + 1 + 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Block data file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File format version
    pub version: u32,
    /// Reserved flag bits
    pub flags: u32,
}

fn header_fields(input: &[u8]) -> IResult<&[u8], (&[u8], u32, u32)> {
    tuple((tag(BLOCK_MAGIC), le_u32, le_u32))(input)
}

/// Parse a block data file header
pub fn parse_header(input: &[u8]) -> Result<FileHeader> {
    if input.len() < HEADER_LEN {
        return Err(Error::Parse("Input too short for header".to_string()));
    }
    if &input[..BLOCK_MAGIC.len()] != BLOCK_MAGIC {
        return Err(Error::Parse("Invalid block file magic".to_string()));
    }
    let (_, (_, version, flags)) = header_fields(input)?;
    Ok(FileHeader { version, flags })
}

/// Create a block data file header
pub fn create_header(header: &FileHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(BLOCK_MAGIC);
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.flags.to_le_bytes());
    out
}

/// Location of one block inside the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Block key
    pub key: u64,
    /// Byte offset in the data file
    pub offset: u64,
    /// Payload length
    pub len: u32,
}

fn translation_entry(input: &[u8]) -> IResult<&[u8], TranslationEntry> {
    let (rest, (key, offset, len)) = tuple((le_u64, le_u64, le_u32))(input)?;
    Ok((rest, TranslationEntry { key, offset, len }))
}

fn translation_entries(input: &[u8]) -> IResult<&[u8], Vec<TranslationEntry>> {
    length_count(le_u32, translation_entry)(input)
}

/// Parse a translation index file
pub fn parse_translation(input: &[u8]) -> Result<Vec<TranslationEntry>> {
    if input.len() < IDX_MAGIC.len() || &input[..IDX_MAGIC.len()] != IDX_MAGIC {
        return Err(Error::Parse("Invalid index file magic".to_string()));
    }
    let (_, entries) = translation_entries(&input[IDX_MAGIC.len()..])?;
    Ok(entries)
}

/// Encode a translation index file
pub fn encode_translation(entries: &[TranslationEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(IDX_MAGIC.len() + 4 + entries.len() * 20);
    out.extend_from_slice(IDX_MAGIC);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.key.to_le_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
        out.extend_from_slice(&entry.len.to_le_bytes());
    }
    out
}

/// Kind tag of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A checkpoint started at this LSN
    BeginCheckpoint,
    /// The checkpoint begun at the LSN in the payload is durable
    EndCheckpoint,
    /// Opaque client record
    User,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            RecordKind::BeginCheckpoint => 1,
            RecordKind::EndCheckpoint => 2,
            RecordKind::User => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordKind::BeginCheckpoint),
            2 => Some(RecordKind::EndCheckpoint),
            3 => Some(RecordKind::User),
            _ => None,
        }
    }
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: u64,
    /// Record kind
    pub kind: RecordKind,
    /// Record body
    pub payload: Vec<u8>,
}

fn record_checksum(lsn: u64, kind: u8, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&lsn.to_le_bytes());
    digest.update(&[kind]);
    digest.update(payload);
    digest.finalize()
}

/// Encode a log record with its framing and checksum
pub fn encode_record(lsn: u64, kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let kind = kind.to_byte();
    let mut out = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&lsn.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(payload);
    out.extend_from_slice(&record_checksum(lsn, kind, payload).to_le_bytes());
    out
}

fn raw_record(input: &[u8]) -> IResult<&[u8], (u64, u8, &[u8], u32)> {
    let (rest, len) = le_u32(input)?;
    let (rest, lsn) = le_u64(rest)?;
    let (rest, kind) = le_u8(rest)?;
    let (rest, payload) = take(len)(rest)?;
    let (rest, crc) = le_u32(rest)?;
    Ok((rest, (lsn, kind, payload, crc)))
}

/// Parse one record from the front of `input`
///
/// Returns `Ok(None)` for a torn tail (not enough bytes for a whole record),
/// which is how an interrupted append looks after a crash.
pub fn parse_record(input: &[u8]) -> Result<Option<(LogRecord, usize)>> {
    let (rest, (lsn, kind, payload, crc)) = match raw_record(input) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(None),
    };
    if record_checksum(lsn, kind, payload) != crc {
        return Err(Error::Checksum { lsn });
    }
    let kind = RecordKind::from_byte(kind)
        .ok_or_else(|| Error::Parse(format!("Unknown record kind {} at LSN {}", kind, lsn)))?;
    let consumed = input.len() - rest.len();
    Ok(Some((
        LogRecord {
            lsn,
            kind,
            payload: payload.to_vec(),
        },
        consumed,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let header = create_header(&FileHeader { version: 1, flags: 7 });
        let parsed = parse_header(&header).unwrap();

        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.flags, 7);
    }

    #[test]
    fn test_parse_header_invalid_magic() {
        let mut header = create_header(&FileHeader { version: 1, flags: 0 });
        header[0] = b'X';

        assert!(parse_header(&header).is_err());
    }

    #[test]
    fn test_parse_header_too_short() {
        assert!(parse_header(b"FTBLOCK1").is_err());
    }

    #[test]
    fn test_translation_entries() {
        let entries = vec![
            TranslationEntry { key: 3, offset: 16, len: 10 },
            TranslationEntry { key: 9, offset: 26, len: 4 },
        ];
        let encoded = encode_translation(&entries);

        assert_eq!(&encoded[..8], IDX_MAGIC);
        assert_eq!(parse_translation(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_translation_truncated() {
        let entries = vec![TranslationEntry { key: 1, offset: 16, len: 1 }];
        let encoded = encode_translation(&entries);

        assert!(parse_translation(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn test_record_torn_tail_is_none() {
        let encoded = encode_record(5, RecordKind::User, b"hello");

        assert!(parse_record(&encoded[..encoded.len() - 1]).unwrap().is_none());
        let (record, used) = parse_record(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(record.lsn, 5);
        assert_eq!(record.payload, b"hello");
    }

    #[test]
    fn test_record_corrupt_payload() {
        let mut encoded = encode_record(8, RecordKind::BeginCheckpoint, b"abc");
        encoded[14] ^= 0xff;

        assert!(matches!(parse_record(&encoded), Err(Error::Checksum { lsn: 8 })));
    }
}
