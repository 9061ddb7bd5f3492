//! Master Boot Record codec.
//!
//! Works on the raw 512-byte first sector and mutates partition entries in place,
//! so `write` reproduces every byte it did not touch (boot code, disk signature,
//! reserved fields).

use std::fmt;
use std::io::{self, Read, Write};

pub const SECTOR_SIZE: usize = 512;
/// `bytes >> SECTOR_SHIFT` converts to whole 512-byte sectors.
pub const SECTOR_SHIFT: u32 = 9;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

const BOOT_ACTIVE: u8 = 0x80;
const BOOT_INACTIVE: u8 = 0x00;

#[derive(Debug)]
pub enum MbrError {
    BadSignature,
    BadBootFlag { slot: usize, value: u8 },
    SectorOverflow { slot: usize },
    PartitionOverlap { first: usize, second: usize },
    NoPartitions,
    Io(io::Error),
}

impl fmt::Display for MbrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MbrError::BadSignature => write!(f, "bad MBR signature (expected 0x55 0xAA)"),
            MbrError::BadBootFlag { slot, value } => write!(
                f,
                "partition {} has invalid bootable flag 0x{value:02x}",
                slot + 1
            ),
            MbrError::SectorOverflow { slot } => write!(
                f,
                "partition {} extends past the 32-bit sector limit",
                slot + 1
            ),
            MbrError::PartitionOverlap { first, second } => write!(
                f,
                "partitions {} and {} overlap",
                first + 1,
                second + 1
            ),
            MbrError::NoPartitions => write!(f, "partition table has no partitions"),
            MbrError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MbrError {}

impl From<io::Error> for MbrError {
    fn from(err: io::Error) -> Self {
        MbrError::Io(err)
    }
}

/// Decoded copy of one of the four primary partition slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub slot: usize,
    pub boot_flag: u8,
    pub part_type: u8,
    pub lba_start: u32,
    pub lba_len: u32,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.part_type == 0
    }

    pub fn is_bootable(&self) -> bool {
        self.boot_flag == BOOT_ACTIVE
    }

    fn end(&self) -> u64 {
        self.lba_start as u64 + self.lba_len as u64
    }
}

/// Mutable view of a partition slot inside an [`Mbr`].
pub struct PartitionEntry<'a> {
    raw: &'a mut [u8],
}

impl PartitionEntry<'_> {
    pub fn lba_start(&self) -> u32 {
        read_u32(self.raw, 8)
    }

    pub fn lba_len(&self) -> u32 {
        read_u32(self.raw, 12)
    }

    pub fn set_lba_len(&mut self, len: u32) {
        self.raw[12..16].copy_from_slice(&len.to_le_bytes());
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Mbr {
    bytes: [u8; SECTOR_SIZE],
}

impl fmt::Debug for Mbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbr")
            .field("partitions", &self.partitions())
            .finish()
    }
}

impl Mbr {
    /// Reads exactly one sector and rejects it when the boot signature is missing.
    pub fn read<R: Read>(mut r: R) -> Result<Self, MbrError> {
        let mut bytes = [0u8; SECTOR_SIZE];
        r.read_exact(&mut bytes)?;
        let mbr = Self { bytes };
        if !mbr.has_signature() {
            return Err(MbrError::BadSignature);
        }
        Ok(mbr)
    }

    pub fn from_bytes(bytes: [u8; SECTOR_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.bytes
    }

    pub fn write<W: Write>(&self, mut w: W) -> Result<(), MbrError> {
        w.write_all(&self.bytes)?;
        w.flush()?;
        Ok(())
    }

    fn has_signature(&self) -> bool {
        self.bytes[SECTOR_SIZE - 2..] == SIGNATURE
    }

    pub fn partitions(&self) -> [Partition; 4] {
        std::array::from_fn(|slot| {
            let raw = self.slot_bytes(slot);
            Partition {
                slot,
                boot_flag: raw[0],
                part_type: raw[4],
                lba_start: read_u32(raw, 8),
                lba_len: read_u32(raw, 12),
            }
        })
    }

    /// Entry in table `slot` (0..4), `None` past the fourth.
    pub fn partition_mut(&mut self, slot: usize) -> Option<PartitionEntry<'_>> {
        if slot >= 4 {
            return None;
        }
        let off = TABLE_OFFSET + slot * ENTRY_SIZE;
        Some(PartitionEntry {
            raw: &mut self.bytes[off..off + ENTRY_SIZE],
        })
    }

    fn slot_bytes(&self, slot: usize) -> &[u8] {
        let off = TABLE_OFFSET + slot * ENTRY_SIZE;
        &self.bytes[off..off + ENTRY_SIZE]
    }

    pub fn check(&self) -> Result<(), MbrError> {
        if !self.has_signature() {
            return Err(MbrError::BadSignature);
        }
        let parts: Vec<Partition> = self
            .partitions()
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        for p in &parts {
            if p.boot_flag != BOOT_ACTIVE && p.boot_flag != BOOT_INACTIVE {
                return Err(MbrError::BadBootFlag {
                    slot: p.slot,
                    value: p.boot_flag,
                });
            }
            if p.end() > u32::MAX as u64 {
                return Err(MbrError::SectorOverflow { slot: p.slot });
            }
        }
        for a in &parts {
            for b in &parts {
                if a.slot == b.slot || b.lba_len == 0 {
                    continue;
                }
                if a.lba_start >= b.lba_start && (a.lba_start as u64) < b.end() {
                    let (first, second) = (a.slot.min(b.slot), a.slot.max(b.slot));
                    return Err(MbrError::PartitionOverlap { first, second });
                }
            }
        }
        Ok(())
    }

    /// The non-empty partition that starts furthest into the disk.
    pub fn last_partition(&self) -> Option<Partition> {
        self.partitions()
            .into_iter()
            .filter(|p| !p.is_empty())
            .max_by_key(|p| p.lba_start)
    }

    /// Adds `extra_sectors` to the last partition; returns its slot.
    pub fn grow_last_partition(&mut self, extra_sectors: u32) -> Result<usize, MbrError> {
        let last = self.last_partition().ok_or(MbrError::NoPartitions)?;
        let new_len = last
            .lba_len
            .checked_add(extra_sectors)
            .ok_or(MbrError::SectorOverflow { slot: last.slot })?;
        if last.lba_start as u64 + new_len as u64 > u32::MAX as u64 {
            return Err(MbrError::SectorOverflow { slot: last.slot });
        }
        if let Some(mut entry) = self.partition_mut(last.slot) {
            entry.set_lba_len(new_len);
        }
        Ok(last.slot)
    }
}

fn read_u32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

/// Whole sectors covered by `bytes`; a partial trailing sector is dropped.
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes >> SECTOR_SHIFT
}
