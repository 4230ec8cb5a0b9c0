use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    config::buffer_constants::{PAGE_SIZE, SECTOR_SHIFT},
    error::{BlkError, IoStatus},
    storage::page::Page,
};

use super::device::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

impl Direction {
    pub fn index(self) -> usize {
        self as usize
    }
}

// How a buffer or bio is submitted. Read-ahead is a read that fails instead of
// sleeping for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Read,
    ReadAhead,
    Write,
}

impl RwMode {
    pub fn direction(self) -> Direction {
        match self {
            RwMode::Read | RwMode::ReadAhead => Direction::Read,
            RwMode::Write => Direction::Write,
        }
    }
}

bitflags! {
    pub struct BioFlags: u32 {
        const UPTODATE = 1 << 0;
        // Hit the end of the device.
        const EOF = 1 << 1;
        const BOUNCED = 1 << 2;
        const SEG_VALID = 1 << 3;

        const BARRIER = 1 << 8;
        const AHEAD = 1 << 9;
    }
}

#[derive(Clone)]
pub struct BioVec {
    pub page: Arc<Page>,
    pub offset: usize,
    pub len: usize,
}

impl std::fmt::Debug for BioVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BioVec")
            .field("pfn", &self.page.pfn())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl BioVec {
    pub fn phys_addr(&self) -> u64 {
        self.page.phys_addr() + self.offset as u64
    }

    // One past the last byte.
    pub fn end_addr(&self) -> u64 {
        self.phys_addr() + self.len as u64
    }
}

pub type BioEndIo = Box<dyn FnOnce(Bio) + Send>;

// A single I/O: contiguous sectors on one device backed by a vector of page
// segments. `idx` is the first unfinished segment.
pub struct Bio {
    sector: u64,
    dir: Direction,
    flags: BioFlags,
    bdev: Arc<BlockDevice>,

    vecs: Vec<BioVec>,
    idx: usize,
    size: usize,

    error: Option<BlkError>,
    phys_segments: u16,
    hw_segments: u16,

    end_io: Option<BioEndIo>,
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("sector", &self.sector)
            .field("dir", &self.dir)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("idx", &self.idx)
            .field("vecs", &self.vecs)
            .finish()
    }
}

impl Bio {
    pub fn new(bdev: Arc<BlockDevice>, sector: u64, dir: Direction) -> Self {
        Self {
            sector,
            dir,
            flags: BioFlags::UPTODATE,
            bdev,

            vecs: Vec::new(),
            idx: 0,
            size: 0,

            error: None,
            phys_segments: 0,
            hw_segments: 0,

            end_io: None,
        }
    }

    pub fn add_page(&mut self, page: Arc<Page>, len: usize, offset: usize) -> usize {
        if len == 0 || offset + len > PAGE_SIZE {
            return 0;
        }
        self.vecs.push(BioVec { page, offset, len });
        self.size += len;
        self.flags.remove(BioFlags::SEG_VALID);
        len
    }

    pub fn with_end_io<F: FnOnce(Bio) + Send + 'static>(mut self, end_io: F) -> Self {
        self.end_io = Some(Box::new(end_io));
        self
    }

    pub fn set_end_io<F: FnOnce(Bio) + Send + 'static>(&mut self, end_io: F) {
        self.end_io = Some(Box::new(end_io));
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn set_sector(&mut self, sector: u64) {
        self.sector = sector;
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn set_dir(&mut self, dir: Direction) {
        self.dir = dir;
    }

    pub fn flags(&self) -> BioFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BioFlags) {
        self.flags.insert(flags);
    }

    pub fn clear_flags(&mut self, flags: BioFlags) {
        self.flags.remove(flags);
    }

    pub fn is_barrier(&self) -> bool {
        self.flags.contains(BioFlags::BARRIER)
    }

    pub fn is_readahead(&self) -> bool {
        self.flags.contains(BioFlags::AHEAD)
    }

    pub fn bdev(&self) -> &Arc<BlockDevice> {
        &self.bdev
    }

    pub fn set_bdev(&mut self, bdev: Arc<BlockDevice>) {
        self.bdev = bdev;
    }

    // Remaining bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sectors(&self) -> u32 {
        (self.size >> SECTOR_SHIFT) as u32
    }

    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors() as u64
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    // Unfinished segments.
    pub fn segments(&self) -> &[BioVec] {
        &self.vecs[self.idx..]
    }

    pub fn all_segments(&self) -> &[BioVec] {
        &self.vecs
    }

    pub fn cur_sectors(&self) -> u32 {
        self.vecs
            .get(self.idx)
            .map_or(0, |v| (v.len >> SECTOR_SHIFT) as u32)
    }

    pub fn first_vec(&self) -> Option<&BioVec> {
        self.vecs.get(self.idx)
    }

    pub fn last_vec(&self) -> Option<&BioVec> {
        self.vecs.last()
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(BioFlags::UPTODATE)
    }

    pub fn status(&self) -> IoStatus {
        match self.error {
            Some(err) => Err(err),
            None if self.is_uptodate() => Ok(()),
            None => Err(BlkError::Io),
        }
    }

    pub(crate) fn cached_segments(&self) -> Option<(u16, u16)> {
        self.flags
            .contains(BioFlags::SEG_VALID)
            .then_some((self.phys_segments, self.hw_segments))
    }

    pub(crate) fn cache_segments(&mut self, phys: u16, hw: u16) {
        self.phys_segments = phys;
        self.hw_segments = hw;
        self.flags.insert(BioFlags::SEG_VALID);
    }

    // Accounts `bytes` of progress, recording `error` if any.
    pub(crate) fn advance(&mut self, bytes: usize, error: Option<BlkError>) {
        if let Some(err) = error {
            self.flags.remove(BioFlags::UPTODATE);
            self.error.get_or_insert(err);
        }
        self.size = self.size.saturating_sub(bytes);
    }

    // Trims `bytes` off the front of the segment `next_idx` positions past `idx`.
    pub(crate) fn trim_segment(&mut self, next_idx: usize, bytes: usize) {
        let vec = &mut self.vecs[self.idx + next_idx];
        vec.offset += bytes;
        vec.len -= bytes;
    }

    pub(crate) fn skip_segments(&mut self, n: usize) {
        self.idx += n;
        self.flags.remove(BioFlags::SEG_VALID);
    }

    // Runs the completion callback once all bytes are accounted for.
    pub fn complete(mut self) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self);
        }
    }

    // Fails the whole bio.
    pub fn endio(mut self, error: BlkError) {
        let bytes = self.size;
        self.advance(bytes, Some(error));
        self.complete();
    }
}
