// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

macro_rules! div_round_up {
    ($n:expr,$d:expr) => {
        ($n + $d - 1) / $d
    };
}

pub mod async_io;
pub mod vdi;
pub mod vdi_async;
pub mod vdi_sync;

use std::fmt::Debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use thiserror::Error;

const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to detect image type")]
    DetectImageType(#[source] std::io::Error),
    #[error("Failure in vdi")]
    VdiError(#[source] vdi::VdiError),
}

pub enum ImageType {
    Raw,
    Vdi,
}

/// Determine image type through file parsing.
pub fn detect_image_type(f: &mut File) -> std::io::Result<ImageType> {
    let mut block = [0u8; SECTOR_SIZE as usize];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut block)?;

    let image_type = if vdi::probe(&block) == 100 {
        ImageType::Vdi
    } else {
        ImageType::Raw
    };

    Ok(image_type)
}

pub trait BlockBackend: Read + Write + Seek + Send + Debug {
    fn size(&self) -> Result<u64, Error>;
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::vdi::{Vdi, VdiCreateParams};

    #[test]
    fn test_detect_image_type() {
        let tmp = TempFile::new().unwrap();
        let file = tmp.as_file().try_clone().unwrap();
        Vdi::create(
            file,
            &VdiCreateParams {
                disk_size: 2 * 1024 * 1024,
                ..Default::default()
            },
        )
        .unwrap();

        let mut file = tmp.as_file().try_clone().unwrap();
        assert!(matches!(
            detect_image_type(&mut file).unwrap(),
            ImageType::Vdi
        ));

        let raw = TempFile::new().unwrap();
        raw.as_file().write_all(&[0u8; 4096]).unwrap();
        let mut file = raw.as_file().try_clone().unwrap();
        assert!(matches!(
            detect_image_type(&mut file).unwrap(),
            ImageType::Raw
        ));
    }
}
