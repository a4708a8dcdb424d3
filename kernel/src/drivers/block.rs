//! Block device abstraction
//!
//! A uniform two-operation interface over anything that reads and writes
//! 512-byte blocks. Two concrete devices exist: a raw ATA drive and a
//! partition adapter that offsets every request by the partition start and
//! refuses to cross its end.

use super::{ata, partition::PartitionInfo, DiskError};

/// Capability interface for sector-addressable storage
pub trait BlockDevice: Send {
    /// Block size in bytes, 512 everywhere in this system
    fn block_size(&self) -> usize {
        512
    }

    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DiskError>;

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DiskError>;
}

/// A whole ATA drive as a block device
pub struct AtaBlockDevice {
    drive: u8,
}

impl AtaBlockDevice {
    pub fn new(drive: u8) -> Self {
        Self { drive }
    }
}

impl BlockDevice for AtaBlockDevice {
    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DiskError> {
        ata::read_sector(self.drive, block, buffer)
    }

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DiskError> {
        ata::write_sector(self.drive, block, buffer)
    }
}

/// A partition of an inner block device. Block n maps to inner block
/// `lba_start + n`; anything at or past `num_sectors` is out of bounds.
pub struct PartitionBlockDevice<D: BlockDevice> {
    inner: D,
    lba_start: u32,
    num_sectors: u32,
}

impl<D: BlockDevice> PartitionBlockDevice<D> {
    pub fn new(inner: D, part: &PartitionInfo) -> Self {
        Self {
            inner,
            lba_start: part.lba_start,
            num_sectors: part.num_sectors,
        }
    }

    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }
}

impl<D: BlockDevice> BlockDevice for PartitionBlockDevice<D> {
    fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DiskError> {
        if block >= self.num_sectors {
            return Err(DiskError::OutOfBounds);
        }
        self.inner.read_block(self.lba_start + block, buffer)
    }

    fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DiskError> {
        if block >= self.num_sectors {
            return Err(DiskError::OutOfBounds);
        }
        self.inner.write_block(self.lba_start + block, buffer)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! RAM-backed block device for filesystem and partition tests

    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    pub struct RamBlockDevice {
        blocks: Vec<[u8; 512]>,
    }

    impl RamBlockDevice {
        pub fn new(total_blocks: usize) -> Self {
            Self {
                blocks: vec![[0u8; 512]; total_blocks],
            }
        }
    }

    impl BlockDevice for RamBlockDevice {
        fn read_block(&mut self, block: u32, buffer: &mut [u8]) -> Result<(), DiskError> {
            let data = self.blocks.get(block as usize).ok_or(DiskError::OutOfBounds)?;
            let n = buffer.len().min(512);
            buffer[..n].copy_from_slice(&data[..n]);
            Ok(())
        }

        fn write_block(&mut self, block: u32, buffer: &[u8]) -> Result<(), DiskError> {
            let data = self
                .blocks
                .get_mut(block as usize)
                .ok_or(DiskError::OutOfBounds)?;
            let n = buffer.len().min(512);
            data[..n].copy_from_slice(&buffer[..n]);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RamBlockDevice;
    use super::*;

    fn part(lba_start: u32, num_sectors: u32) -> PartitionInfo {
        PartitionInfo {
            drive: 0,
            partition_index: 0,
            lba_start,
            num_sectors,
            part_type: 0x83,
            bootable: false,
        }
    }

    #[test]
    fn partition_device_offsets_requests() {
        crate::memory::heap::test_support::init_test_heap();
        // Mark absolute block 13 on the raw device, then wrap it in a
        // partition starting at 10: relative block 3 must land on it
        let mut raw = RamBlockDevice::new(64);
        let payload = [0xABu8; 512];
        raw.write_block(13, &payload).unwrap();

        let mut dev = PartitionBlockDevice::new(raw, &part(10, 20));
        let mut buf = [0u8; 512];
        dev.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, payload);

        // And a partition write at relative 0 is absolute 10, not 0
        dev.write_block(0, &payload).unwrap();
        dev.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn partition_device_enforces_bounds() {
        crate::memory::heap::test_support::init_test_heap();
        let mut dev = PartitionBlockDevice::new(RamBlockDevice::new(64), &part(10, 20));
        let mut buf = [0u8; 512];
        for block in [20u32, 21, 1000] {
            assert!(matches!(dev.read_block(block, &mut buf), Err(DiskError::OutOfBounds)));
            assert!(matches!(dev.write_block(block, &buf), Err(DiskError::OutOfBounds)));
        }
        // The last in-range block is fine
        assert!(dev.read_block(19, &mut buf).is_ok());
    }
}
