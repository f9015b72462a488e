// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use log::error;
use remain::sorted;
use thiserror::Error;

pub mod blockmap;
pub mod header;
pub(crate) mod io;

use self::blockmap::{BlockMap, VDI_UNALLOCATED, VdiBlockmapError};
use self::header::{VDI_SIGNATURE, VDI_TYPE_DYNAMIC, VDI_TYPE_STATIC, VdiHeader, VdiHeaderError};
use self::io::VdiIoError;
use crate::{BlockBackend, SECTOR_SIZE};

pub use self::header::probe;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiError {
    #[error("Failed to initialize image file {0}")]
    CreateImage(#[source] std::io::Error),
    #[error("Image size is not at least one block")]
    InvalidDiskSize,
    #[error("Not a VDI file {0}")]
    NotVdi(#[source] VdiHeaderError),
    #[error("Failed to read block map {0}")]
    ReadBlockmap(#[source] VdiBlockmapError),
    #[error("Failed reading sectors from disk {0}")]
    ReadFailed(#[source] VdiIoError),
    #[error("Failed to read header {0}")]
    ReadHeader(#[source] std::io::Error),
    #[error("Unsupported VDI image {0}")]
    UnsupportedFormat(#[source] VdiHeaderError),
    #[error("Failed to write block map {0}")]
    WriteBlockmap(#[source] VdiBlockmapError),
    #[error("Failed writing sectors to disk {0}")]
    WriteFailed(#[source] VdiIoError),
    #[error("Failed to write header {0}")]
    WriteHeader(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VdiError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VdiImageType {
    /// Blocks are allocated on first write.
    #[default]
    Dynamic,
    /// All blocks are pre-allocated at create time.
    Static,
}

impl VdiImageType {
    fn as_u32(self) -> u32 {
        match self {
            VdiImageType::Dynamic => VDI_TYPE_DYNAMIC,
            VdiImageType::Static => VDI_TYPE_STATIC,
        }
    }
}

/// Create-time options: the virtual disk size in bytes (required, truncated
/// to a whole number of blocks) and the image type.
#[derive(Clone, Copy, Debug, Default)]
pub struct VdiCreateParams {
    pub disk_size: u64,
    pub image_type: VdiImageType,
}

/// An open VDI image. The header and block map stay resident until the
/// image is dropped; only the allocator mutates them.
#[derive(Debug)]
pub struct Vdi {
    pub(crate) file: File,
    pub(crate) header: VdiHeader,
    pub(crate) blockmap: BlockMap,
    total_sectors: u64,
    current_offset: u64,
}

impl Vdi {
    /// Parse and validate the header from an existing image and load the
    /// block map. The file is closed on failure.
    pub fn new(mut file: File) -> Result<Vdi> {
        file.seek(SeekFrom::Start(0))
            .map_err(VdiError::ReadHeader)?;
        let header = VdiHeader::read_from(&mut file).map_err(VdiError::ReadHeader)?;

        header.validate().map_err(|e| {
            if header.signature != VDI_SIGNATURE {
                VdiError::NotVdi(e)
            } else {
                VdiError::UnsupportedFormat(e)
            }
        })?;

        let blockmap = BlockMap::read_from(
            &mut file,
            u64::from(header.offset_blockmap),
            header.blocks_in_image,
        )
        .map_err(VdiError::ReadBlockmap)?;

        Ok(Vdi {
            file,
            total_sectors: header.disk_size / SECTOR_SIZE,
            header,
            blockmap,
            current_offset: 0,
        })
    }

    /// Initialize a fresh image on `file` and return it opened. Dynamic
    /// images end after the block map; static images are fully
    /// pre-allocated with an identity mapping.
    pub fn create(mut file: File, params: &VdiCreateParams) -> Result<Vdi> {
        let header = VdiHeader::create_for_size(params.disk_size, params.image_type.as_u32());
        if header.blocks_in_image == 0 {
            return Err(VdiError::InvalidDiskSize);
        }

        file.set_len(0).map_err(VdiError::CreateImage)?;
        file.seek(SeekFrom::Start(0))
            .map_err(VdiError::WriteHeader)?;
        header.write_to(&mut file).map_err(VdiError::WriteHeader)?;

        let blockmap = match params.image_type {
            VdiImageType::Dynamic => BlockMap::new_unallocated(header.blocks_in_image),
            VdiImageType::Static => BlockMap::new_identity(header.blocks_in_image),
        };
        blockmap
            .write_all(&mut file, u64::from(header.offset_blockmap))
            .map_err(VdiError::WriteBlockmap)?;

        if params.image_type == VdiImageType::Static {
            let data_bytes = u64::from(header.blocks_in_image) * u64::from(header.block_size);
            file.set_len(u64::from(header.offset_data) + data_bytes)
                .map_err(VdiError::CreateImage)?;
        }

        Ok(Vdi {
            file,
            total_sectors: header.disk_size / SECTOR_SIZE,
            header,
            blockmap,
            current_offset: 0,
        })
    }

    pub fn virtual_disk_size(&self) -> u64 {
        self.header.disk_size
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Reports how many sectors starting at `sector_num` share allocation
    /// status, and whether they are allocated. The run never crosses a
    /// block boundary; the caller re-queries for the next run.
    pub fn is_allocated(&self, sector_num: u64, nb_sectors: u32) -> (bool, u32) {
        if sector_num >= self.total_sectors {
            return (false, 0);
        }
        let nb_sectors = u64::from(nb_sectors).min(self.total_sectors - sector_num);
        io::allocated_run(&self.header, &self.blockmap, sector_num, nb_sectors)
    }

    /// Audit the block map against the header. Returns the number of
    /// consistency violations found; the image is not modified.
    pub fn check(&self) -> u64 {
        let mut n_errors = 0u64;
        let mut blocks_allocated = 0u32;

        for block in 0..self.header.blocks_in_image {
            let entry = self.blockmap.get(block);
            if entry != VDI_UNALLOCATED {
                if entry < self.header.blocks_in_image {
                    blocks_allocated += 1;
                } else {
                    error!("block index {block} too large, is {entry}");
                    n_errors += 1;
                }
            }
        }
        if blocks_allocated != self.header.blocks_allocated {
            error!(
                "allocated blocks mismatch, is {blocks_allocated}, should be {}",
                self.header.blocks_allocated
            );
            n_errors += 1;
        }

        n_errors
    }

    /// Discarding allocated blocks would need snapshot-style deallocation;
    /// nothing to do for flat images.
    pub fn make_empty(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Read for Vdi {
    /// Sector-granular read at the seek cursor. A request reaching past the
    /// virtual end is clipped, not failed.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let sector_index = self.current_offset / SECTOR_SIZE;
        if sector_index >= self.total_sectors {
            return Ok(0);
        }
        let sector_count = div_round_up!(buf.len() as u64, SECTOR_SIZE)
            .min(self.total_sectors - sector_index);

        let nread = io::read(
            &mut self.file,
            buf,
            &self.header,
            &self.blockmap,
            sector_index,
            sector_count,
        )
        .map_err(|e| {
            std::io::Error::other(format!(
                "Failed reading {sector_count} sectors from VDI at index {sector_index}: {e}"
            ))
        })?;
        self.current_offset += nread as u64;
        Ok(nread)
    }
}

impl Write for Vdi {
    /// Sector-granular write at the seek cursor. A request reaching past
    /// the virtual end is clipped, not failed.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let sector_index = self.current_offset / SECTOR_SIZE;
        if sector_index >= self.total_sectors {
            return Ok(0);
        }
        let sector_count = div_round_up!(buf.len() as u64, SECTOR_SIZE)
            .min(self.total_sectors - sector_index);

        let nwritten = io::write(
            &mut self.file,
            buf,
            &mut self.header,
            &mut self.blockmap,
            sector_index,
            sector_count,
        )
        .map_err(|e| {
            std::io::Error::other(format!(
                "Failed writing {sector_count} sectors on VDI at index {sector_index}: {e}"
            ))
        })?;
        self.current_offset += nwritten as u64;
        Ok(nwritten)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

impl Seek for Vdi {
    /// Updates the cursor; positions beyond the virtual disk size are
    /// rejected.
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_offset: Option<u64> = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(off) => {
                if off < 0 {
                    0i64.checked_sub(off).and_then(|increment| {
                        self.virtual_disk_size().checked_sub(increment as u64)
                    })
                } else {
                    self.virtual_disk_size().checked_add(off as u64)
                }
            }
            SeekFrom::Current(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.current_offset.checked_sub(increment as u64))
                } else {
                    self.current_offset.checked_add(off as u64)
                }
            }
        };

        if let Some(o) = new_offset {
            if o <= self.virtual_disk_size() {
                self.current_offset = o;
                return Ok(o);
            }
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Failed seek operation",
        ))
    }
}

impl BlockBackend for Vdi {
    fn size(&self) -> std::result::Result<u64, crate::Error> {
        Ok(self.virtual_disk_size())
    }
}

impl AsRawFd for Vdi {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn create_image(disk_size: u64) -> (TempFile, Vdi) {
        let tmp = TempFile::new().unwrap();
        let file = tmp.as_file().try_clone().unwrap();
        let vdi = Vdi::create(
            file,
            &VdiCreateParams {
                disk_size,
                ..Default::default()
            },
        )
        .unwrap();
        (tmp, vdi)
    }

    fn reopen(tmp: &TempFile) -> Vdi {
        Vdi::new(tmp.as_file().try_clone().unwrap()).unwrap()
    }

    fn read_sectors(vdi: &mut Vdi, sector: u64, n_sectors: usize) -> Vec<u8> {
        vdi.seek(SeekFrom::Start(sector * SECTOR_SIZE)).unwrap();
        let mut buf = vec![0u8; n_sectors * SECTOR_SIZE as usize];
        let nread = vdi.read(&mut buf).unwrap();
        buf.truncate(nread);
        buf
    }

    fn write_sectors(vdi: &mut Vdi, sector: u64, data: &[u8]) {
        vdi.seek(SeekFrom::Start(sector * SECTOR_SIZE)).unwrap();
        assert_eq!(vdi.write(data).unwrap(), data.len());
    }

    fn raw_bytes(tmp: &TempFile, offset: u64, len: usize) -> Vec<u8> {
        let mut file = tmp.as_file().try_clone().unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_create_layout() {
        let (tmp, vdi) = create_image(2 * MIB);

        // One header sector plus one map sector.
        assert_eq!(tmp.as_file().metadata().unwrap().len(), 1024);
        assert_eq!(vdi.total_sectors(), 4096);
        assert_eq!(vdi.header.offset_data, 1024);

        let header_bytes = raw_bytes(&tmp, 0, SECTOR_SIZE as usize);
        let header = VdiHeader::read_from(&mut header_bytes.as_slice()).unwrap();
        header.validate().unwrap();
        assert_eq!(header.blocks_in_image, 2);
        assert_eq!(header.blocks_allocated, 0);

        // Two unallocated entries, then zero padding.
        let map_bytes = raw_bytes(&tmp, 512, SECTOR_SIZE as usize);
        assert_eq!(&map_bytes[..8], &[0xff; 8]);
        assert!(map_bytes[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_then_open() {
        let (tmp, vdi) = create_image(2 * MIB);
        drop(vdi);

        let vdi = reopen(&tmp);
        assert_eq!(vdi.total_sectors(), 2 * MIB / SECTOR_SIZE);
        assert_eq!(vdi.virtual_disk_size(), 2 * MIB);
        assert_eq!(vdi.check(), 0);
    }

    #[test]
    fn test_create_rejects_zero_size() {
        let tmp = TempFile::new().unwrap();
        let file = tmp.as_file().try_clone().unwrap();
        assert!(matches!(
            Vdi::create(file, &VdiCreateParams::default()),
            Err(VdiError::InvalidDiskSize)
        ));

        // Less than one block truncates to zero blocks.
        let file = tmp.as_file().try_clone().unwrap();
        assert!(matches!(
            Vdi::create(
                file,
                &VdiCreateParams {
                    disk_size: MIB / 2,
                    ..Default::default()
                }
            ),
            Err(VdiError::InvalidDiskSize)
        ));
    }

    #[test]
    fn test_fresh_image_reads_zero() {
        let (_tmp, mut vdi) = create_image(2 * MIB);

        let buf = read_sectors(&mut vdi, 0, 4096);
        assert_eq!(buf.len(), 2 * MIB as usize);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_first_allocation() {
        let (tmp, mut vdi) = create_image(2 * MIB);

        write_sectors(&mut vdi, 0, &[0xAA; 512]);
        assert_eq!(vdi.header.blocks_allocated, 1);
        assert_eq!(vdi.blockmap.get(0), 0);
        assert_eq!(vdi.blockmap.get(1), VDI_UNALLOCATED);

        assert_eq!(tmp.as_file().metadata().unwrap().len(), 1024 + MIB);
        let block = raw_bytes(&tmp, 1024, MIB as usize);
        assert!(block[..512].iter().all(|&b| b == 0xAA));
        assert!(block[512..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_second_block_allocation() {
        let (tmp, mut vdi) = create_image(2 * MIB);

        write_sectors(&mut vdi, 0, &[0xAA; 512]);
        write_sectors(&mut vdi, 2048, &[0x55; 512]);
        assert_eq!(vdi.header.blocks_allocated, 2);
        assert_eq!(vdi.blockmap.get(1), 1);

        assert_eq!(tmp.as_file().metadata().unwrap().len(), 1024 + 2 * MIB);
        let block = raw_bytes(&tmp, 1024 + MIB, MIB as usize);
        assert!(block[..512].iter().all(|&b| b == 0x55));
        assert!(block[512..].iter().all(|&b| b == 0));

        // The map sector and header on disk reflect both allocations.
        let vdi = reopen(&tmp);
        assert_eq!(vdi.header.blocks_allocated, 2);
        assert_eq!(vdi.blockmap.get(0), 0);
        assert_eq!(vdi.blockmap.get(1), 1);
        assert_eq!(vdi.check(), 0);
    }

    #[test]
    fn test_reopen_and_read_back() {
        let (tmp, mut vdi) = create_image(2 * MIB);
        write_sectors(&mut vdi, 0, &[0xAA; 512]);
        write_sectors(&mut vdi, 2048, &[0x55; 512]);
        drop(vdi);

        let mut vdi = reopen(&tmp);
        assert_eq!(read_sectors(&mut vdi, 0, 1), vec![0xAA; 512]);
        assert_eq!(read_sectors(&mut vdi, 2048, 1), vec![0x55; 512]);
        // Sectors inside the allocated block that were never written read
        // as zeros.
        assert_eq!(read_sectors(&mut vdi, 1024, 1), vec![0x00; 512]);
        assert_eq!(read_sectors(&mut vdi, 1536, 1), vec![0x00; 512]);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_tmp, mut vdi) = create_image(4 * MIB);

        let data: Vec<u8> = (0..3 * SECTOR_SIZE as usize)
            .map(|i| (i % 251) as u8)
            .collect();
        write_sectors(&mut vdi, 100, &data);
        assert_eq!(read_sectors(&mut vdi, 100, 3), data);
    }

    #[test]
    fn test_non_overlapping_writes_survive_reopen() {
        let (tmp, mut vdi) = create_image(4 * MIB);

        write_sectors(&mut vdi, 5, &[0x11; 1024]);
        write_sectors(&mut vdi, 3000, &[0x22; 512]);
        write_sectors(&mut vdi, 6000, &[0x33; 512]);
        drop(vdi);

        let mut vdi = reopen(&tmp);
        assert_eq!(read_sectors(&mut vdi, 5, 2), vec![0x11; 1024]);
        assert_eq!(read_sectors(&mut vdi, 3000, 1), vec![0x22; 512]);
        assert_eq!(read_sectors(&mut vdi, 6000, 1), vec![0x33; 512]);
        assert_eq!(read_sectors(&mut vdi, 7, 1), vec![0x00; 512]);
        assert_eq!(read_sectors(&mut vdi, 2999, 1), vec![0x00; 512]);
        assert_eq!(
            vdi.header.blocks_allocated,
            vdi.blockmap.allocated_count()
        );
        assert_eq!(vdi.check(), 0);
    }

    #[test]
    fn test_rewrite_reuses_mapping() {
        let (_tmp, mut vdi) = create_image(2 * MIB);

        write_sectors(&mut vdi, 0, &[0xAA; 512]);
        assert_eq!(vdi.header.blocks_allocated, 1);

        write_sectors(&mut vdi, 7, &[0xBB; 512]);
        assert_eq!(vdi.header.blocks_allocated, 1);
        assert_eq!(vdi.blockmap.get(0), 0);

        assert_eq!(read_sectors(&mut vdi, 0, 1), vec![0xAA; 512]);
        assert_eq!(read_sectors(&mut vdi, 7, 1), vec![0xBB; 512]);
    }

    #[test]
    fn test_read_clipped_at_virtual_end() {
        let (_tmp, mut vdi) = create_image(2 * MIB);

        let buf = read_sectors(&mut vdi, 4095, 4);
        assert_eq!(buf.len(), 512);

        vdi.seek(SeekFrom::Start(2 * MIB)).unwrap();
        let mut past = vec![0u8; 512];
        assert_eq!(vdi.read(&mut past).unwrap(), 0);
    }

    #[test]
    fn test_write_across_block_boundary() {
        let (_tmp, mut vdi) = create_image(4 * MIB);

        write_sectors(&mut vdi, 2047, &[0xCD; 1024]);
        // Both halves landed in holes: two allocations with consecutive
        // physical indices.
        assert_eq!(vdi.header.blocks_allocated, 2);
        assert_eq!(vdi.blockmap.get(0), 0);
        assert_eq!(vdi.blockmap.get(1), 1);
        assert_eq!(read_sectors(&mut vdi, 2047, 2), vec![0xCD; 1024]);
    }

    #[test]
    fn test_open_rejects_bad_version() {
        let (tmp, vdi) = create_image(2 * MIB);
        drop(vdi);

        let mut file = tmp.as_file().try_clone().unwrap();
        file.seek(SeekFrom::Start(0x44)).unwrap();
        file.write_all(&0x0002_0001u32.to_le_bytes()).unwrap();

        let file = tmp.as_file().try_clone().unwrap();
        assert!(matches!(
            Vdi::new(file),
            Err(VdiError::UnsupportedFormat(
                VdiHeaderError::UnsupportedVersion(_)
            ))
        ));
    }

    #[test]
    fn test_open_rejects_bad_disk_size() {
        let (tmp, vdi) = create_image(2 * MIB);
        drop(vdi);

        // disk_size lives right after the geometry fields and the unused
        // word, at byte offset 0x170.
        let mut file = tmp.as_file().try_clone().unwrap();
        file.seek(SeekFrom::Start(0x170)).unwrap();
        file.write_all(&(3 * MIB).to_le_bytes()).unwrap();

        let file = tmp.as_file().try_clone().unwrap();
        assert!(matches!(
            Vdi::new(file),
            Err(VdiError::UnsupportedFormat(
                VdiHeaderError::MismatchedDiskSize { .. }
            ))
        ));
    }

    #[test]
    fn test_open_rejects_non_vdi() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();
        let file = tmp.as_file().try_clone().unwrap();
        assert!(matches!(
            Vdi::new(file),
            Err(VdiError::NotVdi(VdiHeaderError::InvalidSignature))
        ));
    }

    #[test]
    fn test_probe_created_image() {
        let (tmp, vdi) = create_image(2 * MIB);
        drop(vdi);

        let first_sector = raw_bytes(&tmp, 0, SECTOR_SIZE as usize);
        assert_eq!(probe(&first_sector), 100);
        assert_eq!(probe(&[0u8; 512]), 0);
    }

    #[test]
    fn test_check_detects_corruption() {
        let (_tmp, mut vdi) = create_image(2 * MIB);
        write_sectors(&mut vdi, 0, &[0xAA; 512]);
        write_sectors(&mut vdi, 2048, &[0x55; 512]);
        assert_eq!(vdi.check(), 0);

        // An over-range entry is one error, the allocation count mismatch
        // it causes is another.
        vdi.blockmap.set(1, 0x10);
        assert_eq!(vdi.check(), 2);
    }

    #[test]
    fn test_is_allocated_runs() {
        let (_tmp, mut vdi) = create_image(4 * MIB);
        write_sectors(&mut vdi, 0, &[0xAA; 512]);

        assert_eq!(vdi.is_allocated(0, 8192), (true, 2048));
        assert_eq!(vdi.is_allocated(100, 8092), (true, 1948));
        assert_eq!(vdi.is_allocated(2048, 6144), (false, 2048));
        // Clipped at the virtual end.
        assert_eq!(vdi.is_allocated(8190, 100), (false, 2));
        assert_eq!(vdi.is_allocated(8192, 100), (false, 0));
    }

    #[test]
    fn test_static_image() {
        let tmp = TempFile::new().unwrap();
        let file = tmp.as_file().try_clone().unwrap();
        let mut vdi = Vdi::create(
            file,
            &VdiCreateParams {
                disk_size: 2 * MIB,
                image_type: VdiImageType::Static,
            },
        )
        .unwrap();

        assert_eq!(vdi.header.blocks_allocated, 2);
        assert_eq!(vdi.blockmap.get(0), 0);
        assert_eq!(vdi.blockmap.get(1), 1);
        assert_eq!(tmp.as_file().metadata().unwrap().len(), 1024 + 2 * MIB);

        // Pre-allocated blocks read as zeros and are written in place.
        assert!(read_sectors(&mut vdi, 0, 4096).iter().all(|&b| b == 0));
        write_sectors(&mut vdi, 2048, &[0x77; 512]);
        assert_eq!(vdi.header.blocks_allocated, 2);
        drop(vdi);

        let mut vdi = reopen(&tmp);
        assert_eq!(vdi.header.image_type, VDI_TYPE_STATIC);
        assert_eq!(vdi.check(), 0);
        assert_eq!(read_sectors(&mut vdi, 2048, 1), vec![0x77; 512]);
    }

    #[test]
    fn test_seek_bounds() {
        let (_tmp, mut vdi) = create_image(2 * MIB);

        assert_eq!(vdi.seek(SeekFrom::Start(2 * MIB)).unwrap(), 2 * MIB);
        assert!(vdi.seek(SeekFrom::Start(2 * MIB + 1)).is_err());
        assert_eq!(vdi.seek(SeekFrom::End(-512)).unwrap(), 2 * MIB - 512);
        assert_eq!(vdi.seek(SeekFrom::Current(512)).unwrap(), 2 * MIB);
        assert!(vdi.seek(SeekFrom::Current(1)).is_err());
    }

    #[test]
    fn test_make_empty_is_noop() {
        let (_tmp, mut vdi) = create_image(2 * MIB);
        write_sectors(&mut vdi, 0, &[0xAA; 512]);
        vdi.make_empty().unwrap();
        assert_eq!(read_sectors(&mut vdi, 0, 1), vec![0xAA; 512]);
    }
}
