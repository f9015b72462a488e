// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use crate::async_io::{AsyncIo, BorrowedDiskFd, DiskFile, DiskFileError, DiskFileResult};
use crate::vdi::{Result as VdiResult, Vdi};
use crate::vdi_async::VdiAsync;

pub struct VdiDiskSync {
    vdi: Arc<Mutex<Vdi>>,
}

impl VdiDiskSync {
    pub fn new(f: File) -> VdiResult<Self> {
        Ok(VdiDiskSync {
            vdi: Arc::new(Mutex::new(Vdi::new(f)?)),
        })
    }
}

impl DiskFile for VdiDiskSync {
    fn size(&mut self) -> DiskFileResult<u64> {
        Ok(self.vdi.lock().unwrap().virtual_disk_size())
    }

    fn new_async_io(&self, _ring_depth: u32) -> DiskFileResult<Box<dyn AsyncIo>> {
        Ok(
            Box::new(VdiAsync::new(self.vdi.clone()).map_err(DiskFileError::NewAsyncIo)?)
                as Box<dyn AsyncIo>,
        )
    }

    fn fd(&mut self) -> BorrowedDiskFd<'_> {
        let lock = self.vdi.lock().unwrap();
        BorrowedDiskFd::new(lock.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::SECTOR_SIZE;
    use crate::vdi::VdiCreateParams;

    #[test]
    fn test_disk_file_surface() {
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

        let mut disk = VdiDiskSync::new(tmp.as_file().try_clone().unwrap()).unwrap();
        assert_eq!(disk.size().unwrap(), 2 * 1024 * 1024);
        assert!(disk.fd().as_raw_fd() >= 0);

        // Write through one AsyncIo, observe through another.
        let mut aio = disk.new_async_io(128).unwrap();
        let mut data = vec![0x5Au8; SECTOR_SIZE as usize];
        let iovec = [libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        }];
        aio.write_vectored(0, &iovec, 7).unwrap();
        assert_eq!(aio.next_completed_request().unwrap(), (7, 512));
        drop(aio);

        let mut aio = disk.new_async_io(128).unwrap();
        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        let iovec = [libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        }];
        aio.read_vectored(0, &iovec, 8).unwrap();
        assert_eq!(aio.next_completed_request().unwrap(), (8, 512));
        assert_eq!(buf, data);
    }

    #[test]
    fn test_open_failure_propagates() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();
        assert!(VdiDiskSync::new(tmp.as_file().try_clone().unwrap()).is_err());
    }
}
