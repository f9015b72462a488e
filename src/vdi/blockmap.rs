// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use remain::sorted;
use thiserror::Error;

use crate::SECTOR_SIZE;

/// Entries with this value have no backing block; reads yield zeros.
pub const VDI_UNALLOCATED: u32 = u32::MAX;

/// Block map entries per map sector.
pub const ENTRIES_PER_SECTOR: u32 = SECTOR_SIZE as u32 / 4;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiBlockmapError {
    #[error("Failed to read block map {0}")]
    ReadBlockmap(#[source] io::Error),
    #[error("Failed to write block map {0}")]
    WriteBlockmap(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VdiBlockmapError>;

/// The indirection table mapping virtual block index to physical block
/// index. Held in host order; entries are converted at the file boundary.
#[derive(Clone, Debug)]
pub struct BlockMap {
    entries: Vec<u32>,
}

impl BlockMap {
    /// A map for a dynamic image: every block unallocated.
    pub fn new_unallocated(blocks: u32) -> BlockMap {
        BlockMap {
            entries: vec![VDI_UNALLOCATED; blocks as usize],
        }
    }

    /// A map for a static image: every block backed by its own index.
    pub fn new_identity(blocks: u32) -> BlockMap {
        BlockMap {
            entries: (0..blocks).collect(),
        }
    }

    /// Read all entries from the image file.
    pub fn read_from(f: &mut File, offset: u64, blocks: u32) -> Result<BlockMap> {
        f.seek(SeekFrom::Start(offset))
            .map_err(VdiBlockmapError::ReadBlockmap)?;
        let mut entries = vec![0u32; blocks as usize];
        f.read_u32_into::<LittleEndian>(&mut entries)
            .map_err(VdiBlockmapError::ReadBlockmap)?;
        Ok(BlockMap { entries })
    }

    /// Write the whole map, zero padded to a sector boundary.
    pub fn write_all(&self, f: &mut File, offset: u64) -> Result<()> {
        f.seek(SeekFrom::Start(offset))
            .map_err(VdiBlockmapError::WriteBlockmap)?;
        for entry in &self.entries {
            f.write_u32::<LittleEndian>(*entry)
                .map_err(VdiBlockmapError::WriteBlockmap)?;
        }
        let bytes = self.entries.len() * 4;
        let padding = (div_round_up!(bytes as u64, SECTOR_SIZE) * SECTOR_SIZE) as usize - bytes;
        if padding != 0 {
            f.write_all(&vec![0u8; padding])
                .map_err(VdiBlockmapError::WriteBlockmap)?;
        }
        Ok(())
    }

    /// The 512-byte image of the 128-entry group containing `entry_index`,
    /// and the group's byte offset relative to the start of the on-disk map.
    /// Slots past the end of the map are the zero padding of the last sector.
    pub fn entry_sector(&self, entry_index: u32) -> ([u8; SECTOR_SIZE as usize], u64) {
        let group = entry_index & !(ENTRIES_PER_SECTOR - 1);
        let mut sector = [0u8; SECTOR_SIZE as usize];
        for i in 0..ENTRIES_PER_SECTOR {
            let index = (group + i) as usize;
            if index < self.entries.len() {
                LittleEndian::write_u32(&mut sector[i as usize * 4..], self.entries[index]);
            }
        }
        (sector, u64::from(group / ENTRIES_PER_SECTOR) * SECTOR_SIZE)
    }

    /// Write the single map sector containing `entry_index`.
    pub fn write_entry_sector(
        &self,
        f: &mut File,
        offset_blockmap: u64,
        entry_index: u32,
    ) -> Result<()> {
        let (sector, group_offset) = self.entry_sector(entry_index);
        f.seek(SeekFrom::Start(offset_blockmap + group_offset))
            .map_err(VdiBlockmapError::WriteBlockmap)?;
        f.write_all(&sector)
            .map_err(VdiBlockmapError::WriteBlockmap)?;
        Ok(())
    }

    pub fn get(&self, index: u32) -> u32 {
        self.entries[index as usize]
    }

    pub fn set(&mut self, index: u32, entry: u32) {
        self.entries[index as usize] = entry;
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that reference a physical block.
    pub fn allocated_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|&&e| e != VDI_UNALLOCATED)
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_map_sector_roundtrip() {
        let tmp = TempFile::new().unwrap();
        let mut file = tmp.into_file();

        // 300 entries span three map sectors, the last one partly padding.
        let mut map = BlockMap::new_unallocated(300);
        map.set(0, 7);
        map.set(130, 1);
        map.set(299, 2);
        map.write_all(&mut file, 0).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 3 * SECTOR_SIZE);

        map.set(131, 3);
        map.write_entry_sector(&mut file, 0, 131).unwrap();

        let reread = BlockMap::read_from(&mut file, 0, 300).unwrap();
        for i in 0..300 {
            assert_eq!(reread.get(i), map.get(i), "entry {i}");
        }
        assert_eq!(reread.allocated_count(), 4);
    }

    #[test]
    fn test_last_sector_padding_is_zero() {
        let tmp = TempFile::new().unwrap();
        let mut file = tmp.into_file();

        let map = BlockMap::new_unallocated(2);
        map.write_all(&mut file, 0).unwrap();

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut bytes = vec![0u8; SECTOR_SIZE as usize];
        file.read_exact(&mut bytes).unwrap();
        assert_eq!(&bytes[..8], &[0xff; 8]);
        assert!(bytes[8..].iter().all(|&b| b == 0));

        // The sector image used by the allocator shows the same padding.
        let (sector, group_offset) = map.entry_sector(1);
        assert_eq!(group_offset, 0);
        assert_eq!(sector.to_vec(), bytes);
    }

    #[test]
    fn test_identity_map() {
        let map = BlockMap::new_identity(4);
        assert_eq!(map.allocated_count(), 4);
        for i in 0..4 {
            assert_eq!(map.get(i), i);
        }
    }
}
