//! GDeflate container format.
//!
//! A GDeflate stream is a fixed header followed by a table of block
//! descriptors. Blocks are compressed independently so they can be
//! decompressed in parallel. This crate parses and validates the container;
//! it does not decompress block payloads.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! header (32 bytes)
//! [magic:u32][major:u16][minor:u16][flags:u32][uncompressed:u32][compressed:u32][block_count:u32][reserved:2×u32]
//!
//! block descriptor (24 bytes, repeated block_count times)
//! [offset:u64][compressed:u32][uncompressed:u32][checksum:u32][pad:u32]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// `"GDFL"` read as a little-endian `u32`.
pub const MAGIC: u32 = 0x4744_464C;

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Largest uncompressed size a single block may declare.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

pub const HEADER_SIZE: usize = 32;
pub const BLOCK_INFO_SIZE: usize = 24;

/// Why a buffer is not a well-formed GDeflate container.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("{0} must be non-zero")]
    ZeroSized(&'static str),

    #[error("block {index} declares {size} uncompressed bytes, limit is {MAX_BLOCK_SIZE}")]
    OversizedBlock { index: usize, size: u32 },

    #[error("header declares {expected} blocks, found {actual}")]
    BlockCountMismatch { expected: u32, actual: usize },
}

/// Stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    pub block_count: u32,
    pub reserved: [u32; 2],
}

impl FileHeader {
    /// A current-version header with no flags set.
    pub fn new(uncompressed_size: u32, compressed_size: u32, block_count: u32) -> Self {
        Self {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            flags: 0,
            uncompressed_size,
            compressed_size,
            block_count,
            reserved: [0; 2],
        }
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != MAGIC {
            return Err(FormatError::BadMagic(self.magic));
        }
        if self.version_major != VERSION_MAJOR {
            return Err(FormatError::UnsupportedVersion(self.version_major));
        }
        if self.uncompressed_size == 0 {
            return Err(FormatError::ZeroSized("uncompressed_size"));
        }
        if self.compressed_size == 0 {
            return Err(FormatError::ZeroSized("compressed_size"));
        }
        if self.block_count == 0 {
            return Err(FormatError::ZeroSized("block_count"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32_le(self.magic);
        buf.put_u16_le(self.version_major);
        buf.put_u16_le(self.version_minor);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.uncompressed_size);
        buf.put_u32_le(self.compressed_size);
        buf.put_u32_le(self.block_count);
        buf.put_u32_le(self.reserved[0]);
        buf.put_u32_le(self.reserved[1]);

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        Self {
            magic: buf.get_u32_le(),
            version_major: buf.get_u16_le(),
            version_minor: buf.get_u16_le(),
            flags: buf.get_u32_le(),
            uncompressed_size: buf.get_u32_le(),
            compressed_size: buf.get_u32_le(),
            block_count: buf.get_u32_le(),
            reserved: [buf.get_u32_le(), buf.get_u32_le()],
        }
    }
}

/// Descriptor of one compressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block within the compressed stream.
    pub offset: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub checksum: u32,
}

impl BlockInfo {
    fn validate(&self, index: usize) -> Result<(), FormatError> {
        if self.compressed_size == 0 {
            return Err(FormatError::ZeroSized("block compressed_size"));
        }
        if self.uncompressed_size == 0 {
            return Err(FormatError::ZeroSized("block uncompressed_size"));
        }
        if self.uncompressed_size > MAX_BLOCK_SIZE {
            return Err(FormatError::OversizedBlock {
                index,
                size: self.uncompressed_size,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_INFO_SIZE] {
        let mut buf = BytesMut::with_capacity(BLOCK_INFO_SIZE);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.compressed_size);
        buf.put_u32_le(self.uncompressed_size);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(0);

        let mut out = [0u8; BLOCK_INFO_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(buf: &mut &[u8]) -> Self {
        let info = Self {
            offset: buf.get_u64_le(),
            compressed_size: buf.get_u32_le(),
            uncompressed_size: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        };
        buf.advance(4);
        info
    }
}

/// A parsed header together with its block table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub header: FileHeader,
    pub blocks: Vec<BlockInfo>,
}

impl StreamInfo {
    /// Checks the header, each block, and that the table has
    /// `header.block_count` entries.
    pub fn new(header: FileHeader, blocks: Vec<BlockInfo>) -> Result<Self, FormatError> {
        header.validate()?;
        if blocks.len() != header.block_count as usize {
            return Err(FormatError::BlockCountMismatch {
                expected: header.block_count,
                actual: blocks.len(),
            });
        }
        for (index, block) in blocks.iter().enumerate() {
            block.validate(index)?;
        }
        Ok(Self { header, blocks })
    }

    /// Sum of the blocks' uncompressed sizes.
    pub fn total_uncompressed_size(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| u64::from(b.uncompressed_size))
            .sum()
    }

    /// Sum of the blocks' compressed sizes.
    pub fn total_compressed_size(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| u64::from(b.compressed_size))
            .sum()
    }

    /// Header followed by the block table.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.blocks.len() * BLOCK_INFO_SIZE);
        out.extend_from_slice(&self.header.to_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&block.to_bytes());
        }
        out
    }
}

/// Parses and validates the header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<FileHeader, FormatError> {
    if data.len() < HEADER_SIZE {
        return Err(FormatError::Truncated {
            what: "header",
            needed: HEADER_SIZE,
            available: data.len(),
        });
    }
    let header = FileHeader::decode(data);
    header.validate()?;
    Ok(header)
}

/// Parses `block_count` descriptors from the start of `data`.
pub fn parse_block_table(data: &[u8], block_count: u32) -> Result<Vec<BlockInfo>, FormatError> {
    let count = block_count as usize;
    let needed = count
        .checked_mul(BLOCK_INFO_SIZE)
        .ok_or(FormatError::Truncated {
            what: "block table",
            needed: usize::MAX,
            available: data.len(),
        })?;
    if data.len() < needed {
        return Err(FormatError::Truncated {
            what: "block table",
            needed,
            available: data.len(),
        });
    }

    let mut buf = &data[..needed];
    let mut blocks = Vec::with_capacity(count);
    for index in 0..count {
        let block = BlockInfo::decode(&mut buf);
        block.validate(index)?;
        blocks.push(block);
    }
    Ok(blocks)
}

/// Parses a header and the block table that follows it.
pub fn parse_stream(data: &[u8]) -> Result<StreamInfo, FormatError> {
    let header = parse_header(data)?;
    let blocks = parse_block_table(&data[HEADER_SIZE..], header.block_count)?;
    StreamInfo::new(header, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn block(offset: u64, compressed: u32, uncompressed: u32) -> BlockInfo {
        BlockInfo {
            offset,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
            checksum: 0x1111_1111,
        }
    }

    fn two_block_stream() -> Vec<u8> {
        StreamInfo {
            header: FileHeader::new(2048, 1024, 2),
            blocks: vec![block(0, 512, 1024), block(512, 512, 1024)],
        }
        .to_bytes()
    }

    #[test]
    fn test_header_layout() {
        let bytes = FileHeader::new(1024, 512, 1).to_bytes();
        assert_eq!(&bytes[..4], b"LFDG");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), VERSION_MAJOR);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 1024);
        assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 1);
    }

    #[test]
    fn test_parse_valid_header() {
        let header = parse_header(&FileHeader::new(1024, 512, 1).to_bytes()).unwrap();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.uncompressed_size, 1024);
        assert_eq!(header.block_count, 1);
    }

    #[test]
    fn test_parse_stream() {
        let info = parse_stream(&two_block_stream()).unwrap();
        assert_eq!(info.blocks.len(), 2);
        assert_eq!(info.blocks[1].offset, 512);
        assert_eq!(info.total_uncompressed_size(), 2048);
        assert_eq!(info.total_compressed_size(), 1024);
    }

    #[test]
    fn test_block_table_ignores_trailing_payload() {
        let mut data = two_block_stream();
        data.extend_from_slice(&[0xAB; 100]);
        assert_eq!(parse_stream(&data).unwrap().blocks.len(), 2);
    }

    #[test]
    fn test_bad_magic() {
        let mut header = FileHeader::new(1024, 512, 1);
        header.magic = 0xDEAD_BEEF;
        assert_eq!(
            parse_header(&header.to_bytes()),
            Err(FormatError::BadMagic(0xDEAD_BEEF))
        );
    }

    #[test]
    fn test_wrong_version() {
        let mut header = FileHeader::new(1024, 512, 1);
        header.version_major = 2;
        assert_eq!(
            parse_header(&header.to_bytes()),
            Err(FormatError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_minor_version_is_accepted() {
        let mut header = FileHeader::new(1024, 512, 1);
        header.version_minor = 7;
        assert!(parse_header(&header.to_bytes()).is_ok());
    }

    #[test_case(0, 512, 1, "uncompressed_size" ; "zero uncompressed")]
    #[test_case(1024, 0, 1, "compressed_size" ; "zero compressed")]
    #[test_case(1024, 512, 0, "block_count" ; "zero blocks")]
    fn test_zero_sized_header_fields(
        uncompressed: u32,
        compressed: u32,
        blocks: u32,
        field: &'static str,
    ) {
        let bytes = FileHeader::new(uncompressed, compressed, blocks).to_bytes();
        assert_eq!(parse_header(&bytes), Err(FormatError::ZeroSized(field)));
    }

    #[test_case(0 ; "empty")]
    #[test_case(31 ; "one byte short")]
    fn test_truncated_header(len: usize) {
        let bytes = FileHeader::new(1024, 512, 1).to_bytes();
        assert!(matches!(
            parse_header(&bytes[..len]),
            Err(FormatError::Truncated { what: "header", .. })
        ));
    }

    #[test]
    fn test_truncated_block_table() {
        let data = two_block_stream();
        let err = parse_stream(&data[..data.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            FormatError::Truncated {
                what: "block table",
                needed: 2 * BLOCK_INFO_SIZE,
                available: 2 * BLOCK_INFO_SIZE - 1,
            }
        );
    }

    #[test_case(block(0, 0, 1024), FormatError::ZeroSized("block compressed_size") ; "zero compressed block")]
    #[test_case(block(0, 512, 0), FormatError::ZeroSized("block uncompressed_size") ; "zero uncompressed block")]
    #[test_case(block(0, 512, MAX_BLOCK_SIZE + 1), FormatError::OversizedBlock { index: 0, size: MAX_BLOCK_SIZE + 1 } ; "oversized block")]
    fn test_invalid_block(bad: BlockInfo, expected: FormatError) {
        assert_eq!(parse_block_table(&bad.to_bytes(), 1), Err(expected));
    }

    #[test]
    fn test_max_block_size_is_accepted() {
        let table = block(0, 1, MAX_BLOCK_SIZE).to_bytes();
        assert_eq!(parse_block_table(&table, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_block_count_mismatch() {
        let err = StreamInfo::new(FileHeader::new(1024, 512, 3), vec![block(0, 512, 1024)])
            .unwrap_err();
        assert_eq!(
            err,
            FormatError::BlockCountMismatch {
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn test_huge_block_count_is_truncation() {
        assert!(matches!(
            parse_block_table(&[0u8; 48], u32::MAX),
            Err(FormatError::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = parse_stream(&data);
        }

        #[test]
        fn prop_valid_streams_parse(
            sizes in proptest::collection::vec((1u32..=MAX_BLOCK_SIZE, 1u32..=MAX_BLOCK_SIZE), 1..16)
        ) {
            let mut offset = 0u64;
            let blocks: Vec<BlockInfo> = sizes
                .iter()
                .map(|&(compressed, uncompressed)| {
                    let b = block(offset, compressed, uncompressed);
                    offset += u64::from(compressed);
                    b
                })
                .collect();
            let info = StreamInfo::new(
                FileHeader::new(1, 1, blocks.len() as u32),
                blocks.clone(),
            )
            .unwrap();

            let parsed = parse_stream(&info.to_bytes()).unwrap();
            prop_assert_eq!(&parsed.blocks, &blocks);
            prop_assert_eq!(parsed.total_compressed_size(), offset);
        }
    }
}
