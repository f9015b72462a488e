// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use remain::sorted;
use thiserror::Error;

use super::blockmap::{BlockMap, VDI_UNALLOCATED, VdiBlockmapError};
use super::header::VdiHeader;
use crate::SECTOR_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiIoError {
    #[error("Failed reading sector block from file {0}")]
    ReadSectorBlock(#[source] io::Error),
    #[error("Failed writing block map sector {0}")]
    WriteBlockmap(#[source] VdiBlockmapError),
    #[error("Failed writing header sector {0}")]
    WriteHeader(#[source] io::Error),
    #[error("Failed writing sector block to file {0}")]
    WriteSectorBlock(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VdiIoError>;

/// One contiguous piece of a request: the longest run starting at
/// `sector_index` that stays inside a single virtual block.
#[derive(Debug)]
pub(crate) struct Segment {
    pub block_index: u32,
    pub sector_in_block: u32,
    pub n_sectors: u32,
    /// Block map entry for the block this segment lands in.
    pub entry: u32,
}

impl Segment {
    pub fn new(
        header: &VdiHeader,
        blockmap: &BlockMap,
        sector_index: u64,
        sector_count: u64,
    ) -> Segment {
        let block_sectors = u64::from(header.block_sectors());
        let block_index = (sector_index / block_sectors) as u32;
        let sector_in_block = (sector_index % block_sectors) as u32;
        let mut n_sectors = block_sectors - u64::from(sector_in_block);
        if n_sectors > sector_count {
            n_sectors = sector_count;
        }

        Segment {
            block_index,
            sector_in_block,
            n_sectors: n_sectors as u32,
            entry: blockmap.get(block_index),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.entry != VDI_UNALLOCATED
    }

    /// Byte offset of this segment in the image file. Only meaningful for
    /// allocated segments.
    pub fn file_offset(&self, header: &VdiHeader) -> u64 {
        u64::from(header.offset_data)
            + u64::from(self.entry) * u64::from(header.block_size)
            + u64::from(self.sector_in_block) * SECTOR_SIZE
    }

    pub fn byte_len(&self) -> usize {
        self.n_sectors as usize * SECTOR_SIZE as usize
    }
}

/// Length and status of the allocation run starting at `sector_index`.
pub fn allocated_run(
    header: &VdiHeader,
    blockmap: &BlockMap,
    sector_index: u64,
    sector_count: u64,
) -> (bool, u32) {
    let segment = Segment::new(header, blockmap, sector_index, sector_count);
    (segment.is_allocated(), segment.n_sectors)
}

/// Synchronous read: unallocated segments yield zeros, allocated ones are
/// served from the backing file. The caller bounds the range to the virtual
/// disk.
pub fn read(
    f: &mut File,
    buf: &mut [u8],
    header: &VdiHeader,
    blockmap: &BlockMap,
    mut sector_index: u64,
    mut sector_count: u64,
) -> Result<usize> {
    let mut read_count = 0usize;

    while sector_count > 0 {
        let segment = Segment::new(header, blockmap, sector_index, sector_count);
        let nbytes = segment.byte_len();

        if segment.is_allocated() {
            f.seek(SeekFrom::Start(segment.file_offset(header)))
                .map_err(VdiIoError::ReadSectorBlock)?;
            f.read_exact(&mut buf[read_count..read_count + nbytes])
                .map_err(VdiIoError::ReadSectorBlock)?;
        } else {
            buf[read_count..read_count + nbytes].fill(0);
        }

        sector_index += u64::from(segment.n_sectors);
        sector_count -= u64::from(segment.n_sectors);
        read_count += nbytes;
    }

    Ok(read_count)
}

/// Synchronous write: allocated segments are updated in place, unallocated
/// ones go through the allocator. The caller bounds the range to the
/// virtual disk.
pub fn write(
    f: &mut File,
    buf: &[u8],
    header: &mut VdiHeader,
    blockmap: &mut BlockMap,
    mut sector_index: u64,
    mut sector_count: u64,
) -> Result<usize> {
    let mut write_count = 0usize;

    while sector_count > 0 {
        let segment = Segment::new(header, blockmap, sector_index, sector_count);
        let nbytes = segment.byte_len();

        if segment.is_allocated() {
            f.seek(SeekFrom::Start(segment.file_offset(header)))
                .map_err(VdiIoError::WriteSectorBlock)?;
            f.write_all(&buf[write_count..write_count + nbytes])
                .map_err(VdiIoError::WriteSectorBlock)?;
        } else {
            allocate_block(
                f,
                header,
                blockmap,
                &segment,
                &buf[write_count..write_count + nbytes],
            )?;
        }

        sector_index += u64::from(segment.n_sectors);
        sector_count -= u64::from(segment.n_sectors);
        write_count += nbytes;
    }

    Ok(write_count)
}

/// Allocate a new physical block for the segment's virtual block and make
/// it durable. Publish order: the data block, then the map sector
/// referencing it, then the header carrying the new allocation count. The
/// order is never relaxed.
fn allocate_block(
    f: &mut File,
    header: &mut VdiHeader,
    blockmap: &mut BlockMap,
    segment: &Segment,
    payload: &[u8],
) -> Result<()> {
    let new_entry = header.blocks_allocated;
    blockmap.set(segment.block_index, new_entry);
    header.blocks_allocated += 1;

    let mut block = vec![0u8; header.block_size as usize];
    let start = segment.sector_in_block as usize * SECTOR_SIZE as usize;
    block[start..start + payload.len()].copy_from_slice(payload);

    f.seek(SeekFrom::Start(
        u64::from(header.offset_data) + u64::from(new_entry) * u64::from(header.block_size),
    ))
    .map_err(VdiIoError::WriteSectorBlock)?;
    f.write_all(&block).map_err(VdiIoError::WriteSectorBlock)?;

    blockmap
        .write_entry_sector(f, u64::from(header.offset_blockmap), segment.block_index)
        .map_err(VdiIoError::WriteBlockmap)?;

    f.seek(SeekFrom::Start(0))
        .map_err(VdiIoError::WriteHeader)?;
    header.write_to(f).map_err(VdiIoError::WriteHeader)?;

    Ok(())
}
