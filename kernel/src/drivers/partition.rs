//! MBR partition tables
//!
//! Reads sector 0 of each drive, validates the 0xAA55 signature and
//! records every non-empty entry of the four-slot table. Also carries the
//! symmetric writers so a blank disk can be given a table.

use spin::Mutex;

use super::{ata, DiskError};

/// MBR signature at byte offset 510
const MBR_SIGNATURE: u16 = 0xAA55;

/// Offset of the four 16-byte partition records
const PARTITION_TABLE_OFFSET: usize = 446;

/// Empty partition type byte
pub const PART_TYPE_EMPTY: u8 = 0x00;
/// Linux filesystem type byte, used by the creation helpers
pub const PART_TYPE_LINUX: u8 = 0x83;

/// At most this many recorded partitions across all drives
pub const MAX_PARTITIONS: usize = 16;

/// A detected partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub drive: u8,
    pub partition_index: u8,
    pub lba_start: u32,
    pub num_sectors: u32,
    pub part_type: u8,
    pub bootable: bool,
}

/// One raw 16-byte MBR record, for the creation paths
#[derive(Debug, Clone, Copy)]
pub struct MbrEntry {
    pub bootable: bool,
    pub part_type: u8,
    pub lba_start: u32,
    pub num_sectors: u32,
}

static PARTITIONS: Mutex<PartitionTable> = Mutex::new(PartitionTable::new());

struct PartitionTable {
    entries: [Option<PartitionInfo>; MAX_PARTITIONS],
    count: usize,
}

impl PartitionTable {
    const fn new() -> Self {
        Self {
            entries: [None; MAX_PARTITIONS],
            count: 0,
        }
    }
}

/// Parse an in-memory MBR sector. Returns the non-empty entries, or
/// `DiskError::BadSignature` when the 0xAA55 marker is missing.
pub fn parse_mbr(drive: u8, sector: &[u8; 512]) -> Result<([Option<PartitionInfo>; 4], usize), DiskError> {
    let signature = u16::from_le_bytes([sector[510], sector[511]]);
    if signature != MBR_SIGNATURE {
        return Err(DiskError::BadSignature);
    }

    let mut found = [None; 4];
    let mut count = 0;
    for i in 0..4 {
        let rec = &sector[PARTITION_TABLE_OFFSET + i * 16..PARTITION_TABLE_OFFSET + (i + 1) * 16];
        let part_type = rec[4];
        if part_type == PART_TYPE_EMPTY {
            continue;
        }
        found[count] = Some(PartitionInfo {
            drive,
            partition_index: i as u8,
            lba_start: u32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]),
            num_sectors: u32::from_le_bytes([rec[12], rec[13], rec[14], rec[15]]),
            part_type,
            bootable: rec[0] == 0x80,
        });
        count += 1;
    }
    Ok((found, count))
}

/// Serialize MBR records into a 512-byte sector (boot code left zeroed)
pub fn build_mbr(entries: &[MbrEntry]) -> [u8; 512] {
    let mut sector = [0u8; 512];
    for (i, entry) in entries.iter().take(4).enumerate() {
        let rec = &mut sector[PARTITION_TABLE_OFFSET + i * 16..PARTITION_TABLE_OFFSET + (i + 1) * 16];
        rec[0] = if entry.bootable { 0x80 } else { 0x00 };
        rec[4] = entry.part_type;
        rec[8..12].copy_from_slice(&entry.lba_start.to_le_bytes());
        rec[12..16].copy_from_slice(&entry.num_sectors.to_le_bytes());
    }
    sector[510..512].copy_from_slice(&MBR_SIGNATURE.to_le_bytes());
    sector
}

fn scan_drive(table: &mut PartitionTable, drive: u8) -> Result<(), DiskError> {
    let mut sector = [0u8; 512];
    ata::read_sector(drive, 0, &mut sector)?;

    let (found, count) = parse_mbr(drive, &sector)?;
    for part in found.iter().take(count).flatten() {
        if table.count >= MAX_PARTITIONS {
            crate::log_warn!("partition: table full, ignoring further entries");
            return Ok(());
        }
        crate::log!(
            "partition: drive {} #{}: type {:#04x} start {} size {} sectors{}",
            drive,
            part.partition_index,
            part.part_type,
            part.lba_start,
            part.num_sectors,
            if part.bootable { " (boot)" } else { "" }
        );
        table.entries[table.count] = Some(*part);
        table.count += 1;
    }
    Ok(())
}

/// Scan every drive's MBR into the global table
pub fn init() {
    let mut table = PARTITIONS.lock();
    table.count = 0;
    table.entries = [None; MAX_PARTITIONS];

    for drive in 0..ata::MAX_DRIVES {
        match scan_drive(&mut table, drive) {
            Ok(()) => {}
            Err(DiskError::NoDevice) => {}
            Err(e) => crate::log_debug!("partition: drive {} scan failed: {:?}", drive, e),
        }
    }
    crate::log!("partition: {} partitions found", table.count);
}

/// Partition by (drive, slot index)
pub fn get(drive: u8, partition_index: u8) -> Option<PartitionInfo> {
    let table = PARTITIONS.lock();
    table.entries[..table.count]
        .iter()
        .flatten()
        .find(|p| p.drive == drive && p.partition_index == partition_index)
        .copied()
}

/// Partition at a table position, for iteration
pub fn at(index: usize) -> Option<PartitionInfo> {
    let table = PARTITIONS.lock();
    if index < table.count {
        table.entries[index]
    } else {
        None
    }
}

pub fn count() -> usize {
    PARTITIONS.lock().count
}

/// Read a sector relative to the partition start. Enforces the partition
/// boundary: a block device built on top of this can never escape its
/// declared range.
pub fn read(part: &PartitionInfo, block: u32, buffer: &mut [u8]) -> Result<(), DiskError> {
    if block >= part.num_sectors {
        return Err(DiskError::OutOfBounds);
    }
    ata::read_sector(part.drive, part.lba_start + block, buffer)
}

/// Write a sector relative to the partition start
pub fn write(part: &PartitionInfo, block: u32, buffer: &[u8]) -> Result<(), DiskError> {
    if block >= part.num_sectors {
        return Err(DiskError::OutOfBounds);
    }
    ata::write_sector(part.drive, part.lba_start + block, buffer)
}

/// Write an MBR with a single partition spanning the whole disk minus the
/// first track (LBA 2048 onward, the usual alignment).
pub fn create_mbr(drive: u8, total_sectors: u32) -> Result<(), DiskError> {
    if total_sectors <= 2048 {
        return Err(DiskError::OutOfBounds);
    }
    let entries = [MbrEntry {
        bootable: true,
        part_type: PART_TYPE_LINUX,
        lba_start: 2048,
        num_sectors: total_sectors - 2048,
    }];
    create_mbr_custom(drive, &entries)
}

/// Write an MBR with caller-supplied records
pub fn create_mbr_custom(drive: u8, entries: &[MbrEntry]) -> Result<(), DiskError> {
    let sector = build_mbr(entries);
    ata::write_sector(drive, 0, &sector)?;
    crate::log!("partition: wrote MBR with {} entries to drive {}", entries.len().min(4), drive);
    Ok(())
}

/// Create an MBR only when the drive does not already carry a valid one
pub fn auto_create(drive: u8, total_sectors: u32) -> Result<bool, DiskError> {
    let mut sector = [0u8; 512];
    ata::read_sector(drive, 0, &mut sector)?;
    if parse_mbr(drive, &sector).is_ok() {
        return Ok(false);
    }
    create_mbr(drive, total_sectors)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_active_partition() {
        // Signature plus one active Linux partition at LBA 2048
        let mut sector = [0u8; 512];
        sector[446] = 0x80;
        sector[446 + 4] = 0x83;
        sector[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        sector[446 + 12..446 + 16].copy_from_slice(&1000u32.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;

        let (found, count) = parse_mbr(0, &sector).unwrap();
        assert_eq!(count, 1);
        let p = found[0].unwrap();
        assert_eq!(p.partition_index, 0);
        assert_eq!(p.lba_start, 2048);
        assert_eq!(p.num_sectors, 1000);
        assert_eq!(p.part_type, 0x83);
        assert!(p.bootable);
    }

    #[test]
    fn rejects_missing_signature() {
        let sector = [0u8; 512];
        assert!(matches!(parse_mbr(0, &sector), Err(DiskError::BadSignature)));
    }

    #[test]
    fn empty_records_are_skipped() {
        let mut sector = [0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        // Slot 2 only
        let rec = 446 + 2 * 16;
        sector[rec + 4] = 0x0C;
        sector[rec + 8..rec + 12].copy_from_slice(&64u32.to_le_bytes());
        sector[rec + 12..rec + 16].copy_from_slice(&128u32.to_le_bytes());

        let (found, count) = parse_mbr(1, &sector).unwrap();
        assert_eq!(count, 1);
        let p = found[0].unwrap();
        assert_eq!(p.partition_index, 2);
        assert!(!p.bootable);
    }

    #[test]
    fn build_and_parse_round_trip() {
        let entries = [
            MbrEntry { bootable: true, part_type: 0x83, lba_start: 2048, num_sectors: 40960 },
            MbrEntry { bootable: false, part_type: 0x0C, lba_start: 43008, num_sectors: 8192 },
        ];
        let sector = build_mbr(&entries);
        let (found, count) = parse_mbr(0, &sector).unwrap();
        assert_eq!(count, 2);
        assert_eq!(found[0].unwrap().num_sectors, 40960);
        assert_eq!(found[1].unwrap().lba_start, 43008);
        assert_eq!(found[1].unwrap().part_type, 0x0C);
    }
}
