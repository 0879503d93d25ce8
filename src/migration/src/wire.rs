//! On-wire framing (SPEC_FULL.md §6): an 8-byte big-endian header word per
//! record, followed by a record-specific body. Byte layout is grounded on
//! `original_source/block-migration.c`'s `qemu_put_be64`/`qemu_get_be64`
//! framing (`DISK_VNUM_OFFSET`, `DISK_NEGOTIATE`, `BLK_MIG_FLAG_*`).

use bitflags::bitflags;

use crate::device::{new_chunk_buf, ChunkBuf, SECTOR_SHIFT};
use crate::error::{MigrationError, Result};
use crate::stream::Stream;

const DISK_VNUM_OFFSET: u32 = 3;
const DISK_VNUM_MASK: u64 = 0x3f;

/// Reserved `iter_num` value marking a negotiation record instead of data.
pub const DISK_NEGOTIATE: u8 = 63;
/// Largest `iter_num` a data record may legitimately carry; 63 is reserved.
pub const MAX_DATA_ITER: u8 = 62;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        const DEVICE_BLOCK = 0x01;
        const EOS          = 0x02;
        const PROGRESS     = 0x04;
    }
}

fn pack_header(value: u64, iter_num: u8, flags: RecordFlags) -> u64 {
    (value << SECTOR_SHIFT) | (((iter_num & 0x3f) as u64) << DISK_VNUM_OFFSET) | flags.bits() as u64
}

fn unpack_header(word: u64) -> (u64, u8, Option<RecordFlags>) {
    let value = word >> SECTOR_SHIFT;
    let iter_num = ((word >> DISK_VNUM_OFFSET) & DISK_VNUM_MASK) as u8;
    let flags = RecordFlags::from_bits(word as u8 & 0x07);
    (value, iter_num, flags)
}

fn write_u64(stream: &mut dyn Stream, word: u64) -> Result<()> {
    stream.write_bytes(&word.to_be_bytes()).map_err(|_| MigrationError::StreamError)
}

fn read_u64(stream: &mut dyn Stream) -> Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_bytes(&mut buf).map_err(|_| MigrationError::StreamError)?;
    Ok(u64::from_be_bytes(buf))
}

fn write_name(stream: &mut dyn Stream, name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(MigrationError::ProtocolFrame(format!(
            "device name {name:?} too long for wire framing"
        )));
    }
    stream
        .write_bytes(&[bytes.len() as u8])
        .map_err(|_| MigrationError::StreamError)?;
    stream.write_bytes(bytes).map_err(|_| MigrationError::StreamError)
}

fn read_name(stream: &mut dyn Stream) -> Result<String> {
    let mut len_buf = [0u8; 1];
    stream.read_bytes(&mut len_buf).map_err(|_| MigrationError::StreamError)?;
    let mut name_buf = vec![0u8; len_buf[0] as usize];
    stream.read_bytes(&mut name_buf).map_err(|_| MigrationError::StreamError)?;
    String::from_utf8(name_buf)
        .map_err(|e| MigrationError::ProtocolFrame(format!("device name is not valid utf-8: {e}")))
}

/// One decoded or to-be-encoded record on the migration wire.
pub enum Record {
    /// Sent once per device during stage 1, before any data records.
    Negotiate { device: String, total_sectors: u64 },
    /// A chunk of sector data. `payload` is always `BLOCK_SIZE` bytes; the
    /// receiver derives the valid prefix from the device's `total_sectors`.
    Data {
        device: String,
        sector: u64,
        iter_num: u8,
        payload: ChunkBuf,
    },
    /// Best-effort progress indicator, 0..=100.
    Progress { percent: u8 },
    /// Terminates one `save_live`/`load_state` call.
    Eos,
}

impl Record {
    pub fn encode(&self, stream: &mut dyn Stream) -> Result<()> {
        match self {
            Record::Negotiate { device, total_sectors } => {
                write_u64(stream, pack_header(0, DISK_NEGOTIATE, RecordFlags::empty()))?;
                write_name(stream, device)?;
                write_u64(stream, *total_sectors)?;
            }
            Record::Data { device, sector, iter_num, payload } => {
                assert!(*iter_num <= MAX_DATA_ITER, "iter_num collides with DISK_NEGOTIATE");
                write_u64(stream, pack_header(*sector, *iter_num, RecordFlags::DEVICE_BLOCK))?;
                write_name(stream, device)?;
                stream.write_bytes(payload.as_ref()).map_err(|_| MigrationError::StreamError)?;
            }
            Record::Progress { percent } => {
                write_u64(stream, pack_header(*percent as u64, 0, RecordFlags::PROGRESS))?;
            }
            Record::Eos => {
                write_u64(stream, pack_header(0, 0, RecordFlags::EOS))?;
            }
        }
        Ok(())
    }

    pub fn decode(stream: &mut dyn Stream) -> Result<Record> {
        let header = read_u64(stream)?;
        let (value, iter_num, flags) = unpack_header(header);
        let flags = flags.ok_or_else(|| {
            MigrationError::ProtocolFrame(format!("unrecognized header flags in {header:#x}"))
        })?;

        if flags.contains(RecordFlags::EOS) {
            return Ok(Record::Eos);
        }
        if flags.contains(RecordFlags::PROGRESS) {
            return Ok(Record::Progress { percent: value as u8 });
        }
        if iter_num == DISK_NEGOTIATE {
            let device = read_name(stream)?;
            let total_sectors = read_u64(stream)?;
            return Ok(Record::Negotiate { device, total_sectors });
        }
        if flags.contains(RecordFlags::DEVICE_BLOCK) {
            let device = read_name(stream)?;
            let mut payload = new_chunk_buf();
            stream.read_bytes(payload.as_mut()).map_err(|_| MigrationError::StreamError)?;
            return Ok(Record::Data { device, sector: value, iter_num, payload });
        }
        Err(MigrationError::ProtocolFrame(format!("empty record header {header:#x}")))
    }
}
