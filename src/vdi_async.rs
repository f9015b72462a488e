// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use vmm_sys_util::eventfd::EventFd;

use crate::async_io::{AsyncIo, AsyncIoError, AsyncIoResult};
use crate::vdi::Vdi;
use crate::vdi::io::Segment;
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

/// Progress of the three-write publish sequence for a request that is
/// allocating a new block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AioPhase {
    /// Between segments; no publish sequence in flight.
    Normal,
    /// The data block has been written; the block map sector is next.
    MustWriteBlockmap,
    /// The block map sector has been written; the header is next.
    MustWriteHeader,
    /// All three writes completed; release the staging buffer and resume
    /// the cursor.
    HeaderWritten,
}

/// Completions delivered to a request's callbacks.
enum AioEvent {
    /// A child read finished with this status.
    ReadDone(i32),
    /// A child write finished with this status.
    WriteDone(i32),
    /// One-shot deferred re-entry after a zero-filled segment, so that no
    /// completion is ever delivered inline with its submission.
    ZeroFilled,
}

/// Per-request control block.
struct VdiRequest {
    /// Virtual cursor.
    sector_num: u64,
    /// Sectors left in the request.
    nb_sectors: u32,
    /// Sectors covered by the segment in flight.
    n_sectors: u32,
    /// Byte position in the payload buffer, advanced with the cursor.
    buf_offset: usize,
    /// Index of the block map entry the in-flight publish sequence covers.
    blockmap_entry: u32,
    /// Staging buffer for a freshly allocated block; released on the
    /// HeaderWritten transition.
    block_buffer: Option<Vec<u8>>,
    phase: AioPhase,
}

/// Drives one request through its completion callbacks. Child submissions
/// enqueue their completions; the loop pops one event at a time and
/// re-enters the matching callback, exactly one child operation in flight.
struct AioDriver<'a> {
    vdi: &'a mut Vdi,
    req: VdiRequest,
    buf: &'a mut [u8],
    pending: VecDeque<AioEvent>,
    finished: Option<i32>,
}

impl<'a> AioDriver<'a> {
    fn new(vdi: &'a mut Vdi, buf: &'a mut [u8], sector_num: u64, nb_sectors: u32) -> Self {
        AioDriver {
            vdi,
            req: VdiRequest {
                sector_num,
                nb_sectors,
                n_sectors: 0,
                buf_offset: 0,
                blockmap_entry: 0,
                block_buffer: None,
                phase: AioPhase::Normal,
            },
            buf,
            pending: VecDeque::new(),
            finished: None,
        }
    }

    fn run_read(mut self) -> i32 {
        self.pending.push_back(AioEvent::ReadDone(0));
        self.run()
    }

    fn run_write(mut self) -> i32 {
        self.pending.push_back(AioEvent::WriteDone(0));
        self.run()
    }

    fn run(mut self) -> i32 {
        while self.finished.is_none() {
            match self.pending.pop_front() {
                Some(AioEvent::ReadDone(ret)) => self.read_cb(ret),
                Some(AioEvent::ZeroFilled) => self.read_cb(0),
                Some(AioEvent::WriteDone(ret)) => self.write_cb(ret),
                None => break,
            }
        }
        self.finished.unwrap_or(-libc::EIO)
    }

    fn read_cb(&mut self, ret: i32) {
        if ret < 0 {
            self.finished = Some(ret);
            return;
        }

        self.req.nb_sectors -= self.req.n_sectors;
        if self.req.nb_sectors == 0 {
            self.finished = Some(0);
            return;
        }
        self.req.sector_num += u64::from(self.req.n_sectors);
        self.req.buf_offset += self.req.n_sectors as usize * SECTOR_SIZE as usize;

        let segment = Segment::new(
            &self.vdi.header,
            &self.vdi.blockmap,
            self.req.sector_num,
            u64::from(self.req.nb_sectors),
        );
        self.req.n_sectors = segment.n_sectors;
        let start = self.req.buf_offset;
        let end = start + segment.byte_len();

        if segment.is_allocated() {
            let offset = segment.file_offset(&self.vdi.header);
            let status = child_read(&mut self.vdi.file, offset, &mut self.buf[start..end]);
            self.pending.push_back(AioEvent::ReadDone(status));
        } else {
            // Block not allocated, return zeros, no need to wait on the
            // child device.
            self.buf[start..end].fill(0);
            self.pending.push_back(AioEvent::ZeroFilled);
        }
    }

    fn write_cb(&mut self, ret: i32) {
        if ret < 0 {
            self.finished = Some(ret);
            return;
        }

        match self.req.phase {
            AioPhase::Normal => {}
            AioPhase::MustWriteBlockmap => {
                // New block written, now write the map sector referencing
                // it. The sector covers the aligned 128-entry group.
                self.req.phase = AioPhase::MustWriteHeader;
                let (sector, group_offset) =
                    self.vdi.blockmap.entry_sector(self.req.blockmap_entry);
                let offset = u64::from(self.vdi.header.offset_blockmap) + group_offset;
                let status = child_write(&mut self.vdi.file, offset, &sector);
                self.pending.push_back(AioEvent::WriteDone(status));
                return;
            }
            AioPhase::MustWriteHeader => {
                // Map sector written, now write the header carrying the
                // incremented allocation count.
                self.req.phase = AioPhase::HeaderWritten;
                let status = child_write_header(self.vdi);
                self.pending.push_back(AioEvent::WriteDone(status));
                return;
            }
            AioPhase::HeaderWritten => {
                // The new block is fully published.
                self.req.block_buffer = None;
                self.req.phase = AioPhase::Normal;
            }
        }

        self.req.nb_sectors -= self.req.n_sectors;
        self.req.sector_num += u64::from(self.req.n_sectors);
        self.req.buf_offset += self.req.n_sectors as usize * SECTOR_SIZE as usize;
        if self.req.nb_sectors == 0 {
            self.finished = Some(0);
            return;
        }

        let segment = Segment::new(
            &self.vdi.header,
            &self.vdi.blockmap,
            self.req.sector_num,
            u64::from(self.req.nb_sectors),
        );
        self.req.n_sectors = segment.n_sectors;
        let start = self.req.buf_offset;
        let end = start + segment.byte_len();

        if segment.is_allocated() {
            let offset = segment.file_offset(&self.vdi.header);
            let status = child_write(&mut self.vdi.file, offset, &self.buf[start..end]);
            self.pending.push_back(AioEvent::WriteDone(status));
        } else {
            // Allocate a new block: stage a zero-filled block with the
            // payload in place and start the publish sequence.
            let new_entry = self.vdi.header.blocks_allocated;
            self.vdi.blockmap.set(segment.block_index, new_entry);
            self.vdi.header.blocks_allocated += 1;

            let mut block = vec![0u8; self.vdi.header.block_size as usize];
            let payload_start = segment.sector_in_block as usize * SECTOR_SIZE as usize;
            block[payload_start..payload_start + (end - start)]
                .copy_from_slice(&self.buf[start..end]);

            let offset = u64::from(self.vdi.header.offset_data)
                + u64::from(new_entry) * u64::from(self.vdi.header.block_size);
            self.req.blockmap_entry = segment.block_index;
            self.req.phase = AioPhase::MustWriteBlockmap;
            let block = self.req.block_buffer.insert(block);
            let status = child_write(&mut self.vdi.file, offset, block);
            self.pending.push_back(AioEvent::WriteDone(status));
        }
    }
}

fn errno_status(e: &std::io::Error) -> i32 {
    -e.raw_os_error().unwrap_or(libc::EIO)
}

fn child_read(f: &mut File, offset: u64, buf: &mut [u8]) -> i32 {
    if let Err(e) = f.seek(SeekFrom::Start(offset)) {
        return errno_status(&e);
    }
    match f.read_exact(buf) {
        Ok(()) => 0,
        Err(e) => errno_status(&e),
    }
}

fn child_write(f: &mut File, offset: u64, buf: &[u8]) -> i32 {
    if let Err(e) = f.seek(SeekFrom::Start(offset)) {
        return errno_status(&e);
    }
    match f.write_all(buf) {
        Ok(()) => 0,
        Err(e) => errno_status(&e),
    }
}

fn child_write_header(vdi: &mut Vdi) -> i32 {
    if let Err(e) = vdi.file.seek(SeekFrom::Start(0)) {
        return errno_status(&e);
    }
    match vdi.header.write_to(&mut vdi.file) {
        Ok(()) => 0,
        Err(e) => errno_status(&e),
    }
}

/// Copy `data` into the iovecs from the start.
///
/// # Safety
/// Caller must ensure iovecs point to valid, writable memory of sufficient
/// size.
unsafe fn scatter_to_iovecs(iovecs: &[libc::iovec], data: &[u8]) {
    let mut pos = 0usize;
    for iov in iovecs {
        if pos == data.len() {
            break;
        }
        let count = std::cmp::min(iov.iov_len, data.len() - pos);
        // SAFETY: iov_base is valid for iov_len bytes per caller contract.
        unsafe {
            std::ptr::copy_nonoverlapping(data[pos..].as_ptr(), iov.iov_base as *mut u8, count)
        };
        pos += count;
    }
}

/// Gather bytes from the iovecs into `data` from the start.
///
/// # Safety
/// Caller must ensure iovecs point to valid, readable memory of sufficient
/// size.
unsafe fn gather_from_iovecs(iovecs: &[libc::iovec], data: &mut [u8]) {
    let mut pos = 0usize;
    for iov in iovecs {
        if pos == data.len() {
            break;
        }
        let count = std::cmp::min(iov.iov_len, data.len() - pos);
        // SAFETY: iov_base is valid for iov_len bytes per caller contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                iov.iov_base as *const u8,
                data[pos..].as_mut_ptr(),
                count,
            )
        };
        pos += count;
    }
}

/// Asynchronous interface to a shared [`Vdi`]. Requests complete through
/// the completion list and the EventFd notifier; completion statuses are
/// the processed byte count, or a negative errno.
pub struct VdiAsync {
    vdi: Arc<Mutex<Vdi>>,
    eventfd: EventFd,
    completion_list: VecDeque<(u64, i32)>,
}

impl VdiAsync {
    pub fn new(vdi: Arc<Mutex<Vdi>>) -> std::io::Result<Self> {
        Ok(VdiAsync {
            vdi,
            eventfd: EventFd::new(libc::EFD_NONBLOCK)?,
            completion_list: VecDeque::new(),
        })
    }

    fn complete(&mut self, user_data: u64, status: i32) {
        self.completion_list.push_back((user_data, status));
        self.eventfd.write(1).unwrap();
    }
}

impl AsyncIo for VdiAsync {
    fn notifier(&self) -> &EventFd {
        &self.eventfd
    }

    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()> {
        let total_len: usize = iovecs.iter().map(|v| v.iov_len).sum();
        let sector_num = (offset as u64) >> SECTOR_SHIFT;

        let mut vdi = self.vdi.lock().unwrap();
        let nb_sectors = ((total_len as u64) >> SECTOR_SHIFT)
            .min(vdi.total_sectors().saturating_sub(sector_num)) as u32;
        let nbytes = nb_sectors as usize * SECTOR_SIZE as usize;

        let status = if nb_sectors == 0 {
            0
        } else if iovecs.len() == 1 {
            // SAFETY: iov_base points to caller-owned writable memory of
            // iov_len bytes.
            let buf = unsafe {
                std::slice::from_raw_parts_mut(iovecs[0].iov_base as *mut u8, iovecs[0].iov_len)
            };
            AioDriver::new(&mut vdi, &mut buf[..nbytes], sector_num, nb_sectors).run_read()
        } else {
            // Scattered payloads go through a bounce buffer copied back on
            // completion.
            let mut bounce = vec![0u8; nbytes];
            let status =
                AioDriver::new(&mut vdi, &mut bounce, sector_num, nb_sectors).run_read();
            // SAFETY: iovecs point to caller-owned writable memory.
            unsafe { scatter_to_iovecs(iovecs, &bounce) };
            status
        };
        drop(vdi);

        self.complete(user_data, if status < 0 { status } else { nbytes as i32 });
        Ok(())
    }

    fn write_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()> {
        let total_len: usize = iovecs.iter().map(|v| v.iov_len).sum();
        let sector_num = (offset as u64) >> SECTOR_SHIFT;

        let mut vdi = self.vdi.lock().unwrap();
        let nb_sectors = ((total_len as u64) >> SECTOR_SHIFT)
            .min(vdi.total_sectors().saturating_sub(sector_num)) as u32;
        let nbytes = nb_sectors as usize * SECTOR_SIZE as usize;

        let status = if nb_sectors == 0 {
            0
        } else if iovecs.len() == 1 {
            // SAFETY: iov_base points to caller-owned memory of iov_len
            // bytes.
            let buf = unsafe {
                std::slice::from_raw_parts_mut(iovecs[0].iov_base as *mut u8, iovecs[0].iov_len)
            };
            AioDriver::new(&mut vdi, &mut buf[..nbytes], sector_num, nb_sectors).run_write()
        } else {
            let mut bounce = vec![0u8; nbytes];
            // SAFETY: iovecs point to caller-owned readable memory.
            unsafe { gather_from_iovecs(iovecs, &mut bounce) };
            AioDriver::new(&mut vdi, &mut bounce, sector_num, nb_sectors).run_write()
        };
        drop(vdi);

        self.complete(user_data, if status < 0 { status } else { nbytes as i32 });
        Ok(())
    }

    fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()> {
        self.vdi
            .lock()
            .unwrap()
            .file
            .sync_all()
            .map_err(AsyncIoError::Fsync)?;

        if let Some(user_data) = user_data {
            self.complete(user_data, 0);
        }
        Ok(())
    }

    fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.completion_list.pop_front()
    }
}
