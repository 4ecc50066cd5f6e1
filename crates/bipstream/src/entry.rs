//! Record framing on top of the raw byte stream.
//!
//! An entry is a fixed-size packed header followed by an opaque payload. The
//! header travels in its own reservation so a serial consumer can decode it
//! first and learn how many payload bytes to wait for, which is exactly the
//! [`Stream::read_serial`] contract.

use crate::packer::{PackError, Packer, Unpacker};
use crate::{Stream, StreamError, StreamPos};
use thiserror::Error;

/// Packed size of an [`EntryHeader`].
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Errors from the record framing layer.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("malformed entry header")]
    Header(#[from] PackError),

    #[error("entry checksum mismatch at position {pos}")]
    ChecksumMismatch { pos: StreamPos },
}

/// Fixed header preceding every entry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Payload size in bytes.
    pub data_size: u32,
    /// Producer-assigned sequence number.
    pub seq: u32,
    /// CRC32 of the payload.
    pub checksum: u32,
    /// Reserved for upper layers.
    pub flags: u32,
}

impl EntryHeader {
    /// Packs the header into `buf`, returning the packed size.
    pub fn pack(&self, buf: &mut [u8]) -> Result<usize, PackError> {
        let mut packer = Packer::new(buf);
        packer.pack_u32(self.data_size)?;
        packer.pack_u32(self.seq)?;
        packer.pack_u32(self.checksum)?;
        packer.pack_u32(self.flags)?;
        debug_assert_eq!(packer.written(), ENTRY_HEADER_SIZE);
        Ok(packer.written())
    }

    /// Unpacks a header from `buf`.
    pub fn unpack(buf: &[u8]) -> Result<Self, PackError> {
        let mut unpacker = Unpacker::new(buf);
        Ok(Self {
            data_size: unpacker.unpack_u32()?,
            seq: unpacker.unpack_u32()?,
            checksum: unpacker.unpack_u32()?,
            flags: unpacker.unpack_u32()?,
        })
    }
}

/// Appends one entry as two reservations: header first, payload second.
///
/// Returns the stream position of the header.
pub fn append_entry(stream: &Stream, seq: u32, payload: &[u8]) -> Result<StreamPos, EntryError> {
    let header = EntryHeader {
        data_size: payload.len() as u32,
        seq,
        checksum: crc32fast::hash(payload),
        flags: 0,
    };

    let mut header_pos = 0;
    stream.write(ENTRY_HEADER_SIZE, |pos, buf| {
        header_pos = pos;
        header.pack(buf).map_err(StreamError::writer)
    })?;

    if !payload.is_empty() {
        stream.write(payload.len(), |_pos, buf| {
            buf.copy_from_slice(payload);
            Ok(payload.len())
        })?;
    }

    Ok(header_pos)
}

/// Consumes the next entry at the serial read cursor.
///
/// Blocks until the header and the full payload are committed, then returns
/// the decoded header and a copy of the payload.
pub fn read_entry_serial(stream: &Stream) -> Result<(EntryHeader, Vec<u8>), EntryError> {
    let mut decoded: Option<(EntryHeader, StreamPos)> = None;

    stream.read_serial(ENTRY_HEADER_SIZE, |trail_pos, buf, payload_size| {
        let header = EntryHeader::unpack(buf).map_err(StreamError::reader)?;
        *payload_size = header.data_size as usize;
        decoded = Some((header, trail_pos));
        Ok(ENTRY_HEADER_SIZE)
    })?;

    let Some((header, payload_pos)) = decoded else {
        return Err(StreamError::ReadNoReadableRange.into());
    };

    let mut payload = vec![0u8; header.data_size as usize];
    if header.data_size > 0 {
        stream.read(payload_pos, payload.len(), |buf| {
            payload.copy_from_slice(buf);
            Ok(buf.len())
        })?;
    }

    if crc32fast::hash(&payload) != header.checksum {
        return Err(EntryError::ChecksumMismatch { pos: payload_pos });
    }

    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = EntryHeader {
            data_size: 1000,
            seq: 7,
            checksum: 0xFEED_FACE,
            flags: 3,
        };

        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        assert_eq!(header.pack(&mut buf).unwrap(), ENTRY_HEADER_SIZE);
        assert_eq!(EntryHeader::unpack(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_pack_needs_full_range() {
        let header = EntryHeader {
            data_size: 0,
            seq: 0,
            checksum: 0,
            flags: 0,
        };
        let mut short = [0u8; ENTRY_HEADER_SIZE - 1];
        assert!(header.pack(&mut short).is_err());
    }
}
