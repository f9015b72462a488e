// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::SECTOR_SIZE;

/// Image signature, little endian at byte offset 0x40.
pub const VDI_SIGNATURE: u32 = 0xbeda_107f;

/// Image version 1.1, the only one supported.
pub const VDI_VERSION_1_1: u32 = 0x0001_0001;

pub const VDI_TYPE_DYNAMIC: u32 = 1;
pub const VDI_TYPE_STATIC: u32 = 2;

/// The only supported block (cluster) size.
pub const VDI_BLOCK_SIZE: u32 = 1024 * 1024;

/// Value the header_size field carries on created images.
const VDI_HEADER_SIZE: u32 = 0x180;

/// VirtualBox images carry an innotek / Sun banner here. The value is
/// ignored on open, so created images use their own.
const VDI_TEXT: &str = "<<< Cloud Hypervisor Virtual Disk Image >>>\n";

const SIGNATURE_OFFSET: usize = 0x40;

#[sorted]
#[derive(Error, Debug)]
pub enum VdiHeaderError {
    #[error("Not a valid VDI signature")]
    InvalidSignature,
    #[error("Unsupported block map offset {0:#x}")]
    MisalignedBlockmapOffset(u32),
    #[error("Unsupported data offset {0:#x}")]
    MisalignedDataOffset(u32),
    #[error("Disk size {disk_size} B does not cover {blocks} blocks of {block_size} B")]
    MismatchedDiskSize {
        disk_size: u64,
        blocks: u32,
        block_size: u32,
    },
    #[error("Unsupported block size {0} B")]
    UnsupportedBlockSize(u32),
    #[error("Unsupported sector size {0} B")]
    UnsupportedSectorSize(u32),
    #[error("Unsupported version {0:#010x}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, VdiHeaderError>;

/// On-disk header, exactly one sector. Multi-byte fields are little endian
/// on disk and host order in memory; the conversion happens field by field
/// in [`VdiHeader::read_from`] and [`VdiHeader::write_to`].
#[derive(Clone, Debug)]
pub struct VdiHeader {
    pub text: [u8; 0x40],
    pub signature: u32,
    pub version: u32,
    pub header_size: u32,
    pub image_type: u32,
    pub image_flags: u32,
    pub description: [u8; 0x100],
    pub offset_blockmap: u32,
    pub offset_data: u32,
    pub cylinders: u32, // disk geometry, unused here
    pub heads: u32,     // disk geometry, unused here
    pub sectors: u32,   // disk geometry, unused here
    pub sector_size: u32,
    unused: u32,
    pub disk_size: u64,
    pub block_size: u32,
    pub block_extra: u32, // unused here
    pub blocks_in_image: u32,
    pub blocks_allocated: u32,
    pub uuid_image: [u8; 16],
    pub uuid_last_snap: [u8; 16],
    pub uuid_link: [u8; 16],
    pub uuid_parent: [u8; 16],
    reserved: [u8; 56],
}

impl VdiHeader {
    /// Reads one header sector from the current position and converts every
    /// multi-byte field from little endian. Byte-array fields pass through
    /// untouched.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<VdiHeader> {
        fn read_bytes<R: Read, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
            let mut buf = [0u8; N];
            r.read_exact(&mut buf)?;
            Ok(buf)
        }

        Ok(VdiHeader {
            text: read_bytes(r)?,
            signature: r.read_u32::<LittleEndian>()?,
            version: r.read_u32::<LittleEndian>()?,
            header_size: r.read_u32::<LittleEndian>()?,
            image_type: r.read_u32::<LittleEndian>()?,
            image_flags: r.read_u32::<LittleEndian>()?,
            description: read_bytes(r)?,
            offset_blockmap: r.read_u32::<LittleEndian>()?,
            offset_data: r.read_u32::<LittleEndian>()?,
            cylinders: r.read_u32::<LittleEndian>()?,
            heads: r.read_u32::<LittleEndian>()?,
            sectors: r.read_u32::<LittleEndian>()?,
            sector_size: r.read_u32::<LittleEndian>()?,
            unused: r.read_u32::<LittleEndian>()?,
            disk_size: r.read_u64::<LittleEndian>()?,
            block_size: r.read_u32::<LittleEndian>()?,
            block_extra: r.read_u32::<LittleEndian>()?,
            blocks_in_image: r.read_u32::<LittleEndian>()?,
            blocks_allocated: r.read_u32::<LittleEndian>()?,
            uuid_image: read_bytes(r)?,
            uuid_last_snap: read_bytes(r)?,
            uuid_link: read_bytes(r)?,
            uuid_parent: read_bytes(r)?,
            reserved: read_bytes(r)?,
        })
    }

    /// Writes one header sector at the current position, converting every
    /// multi-byte field to little endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.text)?;
        w.write_u32::<LittleEndian>(self.signature)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u32::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.image_type)?;
        w.write_u32::<LittleEndian>(self.image_flags)?;
        w.write_all(&self.description)?;
        w.write_u32::<LittleEndian>(self.offset_blockmap)?;
        w.write_u32::<LittleEndian>(self.offset_data)?;
        w.write_u32::<LittleEndian>(self.cylinders)?;
        w.write_u32::<LittleEndian>(self.heads)?;
        w.write_u32::<LittleEndian>(self.sectors)?;
        w.write_u32::<LittleEndian>(self.sector_size)?;
        w.write_u32::<LittleEndian>(self.unused)?;
        w.write_u64::<LittleEndian>(self.disk_size)?;
        w.write_u32::<LittleEndian>(self.block_size)?;
        w.write_u32::<LittleEndian>(self.block_extra)?;
        w.write_u32::<LittleEndian>(self.blocks_in_image)?;
        w.write_u32::<LittleEndian>(self.blocks_allocated)?;
        w.write_all(&self.uuid_image)?;
        w.write_all(&self.uuid_last_snap)?;
        w.write_all(&self.uuid_link)?;
        w.write_all(&self.uuid_parent)?;
        w.write_all(&self.reserved)?;
        Ok(())
    }

    /// Build a header for a fresh image of `disk_size` bytes. The size is
    /// truncated to a whole number of blocks.
    pub fn create_for_size(disk_size: u64, image_type: u32) -> VdiHeader {
        let blocks = (disk_size / u64::from(VDI_BLOCK_SIZE)) as u32;
        let blockmap_bytes = div_round_up!(u64::from(blocks) * 4, SECTOR_SIZE) * SECTOR_SIZE;

        let mut text = [0u8; 0x40];
        text[..VDI_TEXT.len()].copy_from_slice(VDI_TEXT.as_bytes());

        VdiHeader {
            text,
            signature: VDI_SIGNATURE,
            version: VDI_VERSION_1_1,
            header_size: VDI_HEADER_SIZE,
            image_type,
            image_flags: 0,
            description: [0u8; 0x100],
            offset_blockmap: SECTOR_SIZE as u32,
            offset_data: SECTOR_SIZE as u32 + blockmap_bytes as u32,
            cylinders: 0,
            heads: 0,
            sectors: 0,
            sector_size: SECTOR_SIZE as u32,
            unused: 0,
            disk_size: u64::from(blocks) * u64::from(VDI_BLOCK_SIZE),
            block_size: VDI_BLOCK_SIZE,
            block_extra: 0,
            blocks_in_image: blocks,
            blocks_allocated: if image_type == VDI_TYPE_STATIC {
                blocks
            } else {
                0
            },
            uuid_image: *Uuid::new_v4().as_bytes(),
            uuid_last_snap: *Uuid::new_v4().as_bytes(),
            uuid_link: [0u8; 16],
            uuid_parent: [0u8; 16],
            reserved: [0u8; 56],
        }
    }

    /// Checks the constraints an image must satisfy before it is served.
    pub fn validate(&self) -> Result<()> {
        if self.signature != VDI_SIGNATURE {
            return Err(VdiHeaderError::InvalidSignature);
        }
        if self.version != VDI_VERSION_1_1 {
            return Err(VdiHeaderError::UnsupportedVersion(self.version));
        }
        // Only block maps and data areas starting on a sector boundary are
        // supported.
        if u64::from(self.offset_blockmap) % SECTOR_SIZE != 0 {
            return Err(VdiHeaderError::MisalignedBlockmapOffset(
                self.offset_blockmap,
            ));
        }
        if u64::from(self.offset_data) % SECTOR_SIZE != 0 {
            return Err(VdiHeaderError::MisalignedDataOffset(self.offset_data));
        }
        if u64::from(self.sector_size) != SECTOR_SIZE {
            return Err(VdiHeaderError::UnsupportedSectorSize(self.sector_size));
        }
        if self.block_size != VDI_BLOCK_SIZE {
            return Err(VdiHeaderError::UnsupportedBlockSize(self.block_size));
        }
        if self.disk_size != u64::from(self.blocks_in_image) * u64::from(self.block_size) {
            return Err(VdiHeaderError::MismatchedDiskSize {
                disk_size: self.disk_size,
                blocks: self.blocks_in_image,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// Size of one block in sectors.
    pub fn block_sectors(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }
}

/// Scores the first bytes of a candidate file: 100 for a VDI signature,
/// 0 otherwise. No side effects.
pub fn probe(buf: &[u8]) -> u32 {
    if buf.len() < SIGNATURE_OFFSET + 4 {
        return 0;
    }
    let signature = u32::from_le_bytes(
        buf[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    if signature == VDI_SIGNATURE { 100 } else { 0 }
}
