use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use snafu::Snafu;

// Record tags, one byte each, at the front of every journal record. The
// values are part of the on-disk format and must never change.
const TAG_ADD: u8 = 0x00;
const TAG_REMOVE: u8 = 0x01;
const TAG_REMOVE_TENTATIVE: u8 = 0x02;
const TAG_SAVED_XID: u8 = 0x03;
const TAG_UNREMOVE: u8 = 0x04;
const TAG_CONFIRM_REMOVE: u8 = 0x05;
const TAG_ADD_X: u8 = 0x06;
const TAG_REMOVE_TENTATIVE_X: u8 = 0x07;

// Anything claiming a larger payload than this is treated as corruption
// rather than letting a damaged length prefix drive a giant allocation.
pub const MAX_PAYLOAD_LEN: u32 = 128 * 1024 * 1024;

/// Error that occurred while decoding a journal record.
#[derive(Debug, Snafu)]
pub enum DecodeError {
    /// A general I/O error occurred.
    ///
    /// End-of-file conditions are not reported through this variant; a clean
    /// end of the journal decodes as "no more records", and an end-of-file
    /// in the middle of a record decodes as [`DecodeError::Truncated`].
    #[snafu(display("record read I/O error: {source}"))]
    Io { source: io::Error },

    /// The journal ended in the middle of a record.
    ///
    /// This is the expected shape of a crash during an append: the record
    /// tail was never written, and everything before it is intact.
    #[snafu(display("truncated record at end of journal"))]
    Truncated,

    /// The record tag is not one this implementation knows about.
    #[snafu(display("unknown record tag {tag:#04x}"))]
    UnknownTag { tag: u8 },

    /// The record claims a payload larger than any item the queue would
    /// have accepted, which means the length prefix itself is damaged.
    #[snafu(display("payload length {len} exceeds the {MAX_PAYLOAD_LEN} byte limit"))]
    PayloadTooLarge { len: u32 },
}

/// A single journal record.
///
/// Two generations of the format coexist: the legacy `Add` and
/// `RemoveTentative` records (no expiry, no transaction ID) are accepted
/// during replay but never written; `AddX` and `RemoveTentativeX` are their
/// replacements and the only forms appended going forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// Legacy add: a payload with no expiry.
    Add { data: Bytes },
    /// The head item was dequeued non-transactionally.
    Remove,
    /// Legacy tentative remove, carrying no transaction ID. Replay
    /// synthesizes one.
    RemoveTentative,
    /// Snapshot of the transaction ID counter, written during a roll.
    SavedXid { xid: u32 },
    /// A tentatively removed item was rolled back to the head.
    Unremove { xid: u32 },
    /// A tentatively removed item was confirmed and destroyed.
    ConfirmRemove { xid: u32 },
    /// An item was enqueued, with its expiry.
    AddX { expiry: u64, data: Bytes },
    /// The head item was dequeued into an open transaction.
    RemoveTentativeX { xid: u32 },
}

impl Record {
    /// Gets the encoded length of this record, in bytes.
    ///
    /// This is exact: `encode` writes precisely this many bytes, and a
    /// successful decode consumes precisely this many.
    pub fn encoded_len(&self) -> usize {
        match self {
            Record::Remove | Record::RemoveTentative => 1,
            Record::SavedXid { .. }
            | Record::Unremove { .. }
            | Record::ConfirmRemove { .. }
            | Record::RemoveTentativeX { .. } => 1 + 4,
            Record::Add { data } => 1 + 4 + data.len(),
            Record::AddX { data, .. } => 1 + 4 + 8 + data.len(),
        }
    }

    /// Encodes this record into `buf` in the on-disk format: a one-byte tag
    /// followed by little-endian fields, with payloads length-prefixed.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        match self {
            Record::Add { data } => {
                buf.put_u8(TAG_ADD);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Record::Remove => buf.put_u8(TAG_REMOVE),
            Record::RemoveTentative => buf.put_u8(TAG_REMOVE_TENTATIVE),
            Record::SavedXid { xid } => {
                buf.put_u8(TAG_SAVED_XID);
                buf.put_u32_le(*xid);
            }
            Record::Unremove { xid } => {
                buf.put_u8(TAG_UNREMOVE);
                buf.put_u32_le(*xid);
            }
            Record::ConfirmRemove { xid } => {
                buf.put_u8(TAG_CONFIRM_REMOVE);
                buf.put_u32_le(*xid);
            }
            Record::AddX { expiry, data } => {
                buf.put_u8(TAG_ADD_X);
                buf.put_u32_le(data.len() as u32);
                buf.put_u64_le(*expiry);
                buf.put_slice(data);
            }
            Record::RemoveTentativeX { xid } => {
                buf.put_u8(TAG_REMOVE_TENTATIVE_X);
                buf.put_u32_le(*xid);
            }
        }
    }
}

/// Decodes the next record from `reader`.
///
/// Returns `Ok(None)` at a clean end of the journal (no bytes left at a
/// record boundary).
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] if the journal ends partway through a
/// record, [`DecodeError::UnknownTag`] / [`DecodeError::PayloadTooLarge`]
/// for corrupt data, and [`DecodeError::Io`] for any other I/O failure.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>, DecodeError> {
    let mut tag = [0_u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => return Err(DecodeError::Io { source }),
        }
    }

    let record = match tag[0] {
        TAG_ADD => {
            let len = read_u32(reader)?;
            Record::Add {
                data: read_payload(reader, len)?,
            }
        }
        TAG_REMOVE => Record::Remove,
        TAG_REMOVE_TENTATIVE => Record::RemoveTentative,
        TAG_SAVED_XID => Record::SavedXid {
            xid: read_u32(reader)?,
        },
        TAG_UNREMOVE => Record::Unremove {
            xid: read_u32(reader)?,
        },
        TAG_CONFIRM_REMOVE => Record::ConfirmRemove {
            xid: read_u32(reader)?,
        },
        TAG_ADD_X => {
            let len = read_u32(reader)?;
            let expiry = read_u64(reader)?;
            Record::AddX {
                expiry,
                data: read_payload(reader, len)?,
            }
        }
        TAG_REMOVE_TENTATIVE_X => Record::RemoveTentativeX {
            xid: read_u32(reader)?,
        },
        tag => return Err(DecodeError::UnknownTag { tag }),
    };

    Ok(Some(record))
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), DecodeError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::Truncated
        } else {
            DecodeError::Io { source: e }
        }
    })
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, DecodeError> {
    let mut buf = [0_u8; 4];
    fill(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    let mut buf = [0_u8; 8];
    fill(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_payload<R: Read>(reader: &mut R, len: u32) -> Result<Bytes, DecodeError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::PayloadTooLarge { len });
    }
    let mut data = vec![0_u8; len as usize];
    fill(reader, &mut data)?;
    Ok(data.into())
}
