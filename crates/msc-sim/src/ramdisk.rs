use usbd_msc::{BackendError, StorageBackend};

/// Volatile sector store backing the simulated logical unit.
pub struct RamDisk {
    data: Vec<u8>,
    blocks: u32,
    block_size: u32,
}

impl RamDisk {
    pub fn new(blocks: u32, block_size: u32) -> Self {
        RamDisk {
            data: vec![0u8; blocks as usize * block_size as usize],
            blocks,
            block_size,
        }
    }
}

impl StorageBackend for RamDisk {
    fn read(&mut self, lba: u32, num_sectors: u32, buf: &mut [u8]) -> Result<(), BackendError> {
        if lba + num_sectors > self.blocks {
            return Err(BackendError::Read(lba));
        }
        let bs = self.block_size as usize;
        let start = lba as usize * bs;
        buf.copy_from_slice(&self.data[start..start + num_sectors as usize * bs]);
        Ok(())
    }

    fn write(&mut self, lba: u32, num_sectors: u32, buf: &[u8]) -> Result<(), BackendError> {
        if lba + num_sectors > self.blocks {
            return Err(BackendError::Write(lba));
        }
        let bs = self.block_size as usize;
        let start = lba as usize * bs;
        self.data[start..start + num_sectors as usize * bs].copy_from_slice(buf);
        Ok(())
    }

    fn capacity(&mut self) -> Result<u32, BackendError> {
        Ok(self.blocks)
    }

    fn block_size(&mut self) -> Result<u32, BackendError> {
        Ok(self.block_size)
    }
}
