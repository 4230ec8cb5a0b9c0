use std::time::Duration;

use log::info;

pub mod queue_constants {
    pub const BLKDEV_MIN_RQ: usize = 4;
    pub const BLKDEV_MAX_RQ: usize = 128;

    pub const MAX_SECTORS: u32 = 255;
    pub const MAX_PHYS_SEGMENTS: u16 = 128;
    pub const MAX_HW_SEGMENTS: u16 = 128;
    pub const MAX_SEGMENT_SIZE: u32 = 65536;
    pub const SEG_BOUNDARY_MASK: u64 = 0xffff_ffff;
    pub const HARDSECT_SIZE: u32 = 512;

    // Outstanding requests that force an unplug of a plugged queue.
    pub const UNPLUG_THRESH: usize = 4;
    pub const UNPLUG_DELAY_MS: u64 = 3;
}

pub mod batch_constants {
    pub const BLK_BATCH_REQ: u32 = 32;
    pub const BLK_BATCH_TIME_MS: u64 = 20;
}

pub mod buffer_constants {
    pub const PAGE_SHIFT: u32 = 12;
    pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
    pub const SECTOR_SHIFT: u32 = 9;
    pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;
    pub const MAX_BUF_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

    pub const BH_LRU_SIZE: usize = 8;

    pub const DEFAULT_MAX_BUFFER_HEADS: usize = 1 << 20;
    pub const FREE_MORE_MEMORY_RETRIES: usize = 16;
}

pub mod memory_constants {
    // Page frames at or above this number live in high memory.
    pub const HIGHMEM_START_PFN: u64 = 1 << 20;
    pub const MAX_LOW_PFN: u64 = HIGHMEM_START_PFN - 1;
    pub const ISA_DMA_PFN: u64 = (16 << 20) >> super::buffer_constants::PAGE_SHIFT;
}

use buffer_constants::{PAGE_SHIFT, PAGE_SIZE, SECTOR_SHIFT};
use queue_constants::*;

// DMA address limits for `QueueLimits::set_bounce_limit`.
pub const BLK_BOUNCE_HIGH: u64 = memory_constants::MAX_LOW_PFN << PAGE_SHIFT;
pub const BLK_BOUNCE_ANY: u64 = u64::MAX;
pub const BLK_BOUNCE_ISA: u64 = memory_constants::ISA_DMA_PFN << PAGE_SHIFT;

// Per-queue hardware constraints used by merging, segment counting and bouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_sectors: u32,
    pub max_phys_segments: u16,
    pub max_hw_segments: u16,
    pub max_segment_size: u32,
    pub seg_boundary_mask: u64,
    pub hardsect_size: u32,

    // Highest page frame a device can address directly.
    pub bounce_pfn: u64,

    // 0 disables virtual merging.
    pub vmerge_boundary: u64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_sectors: MAX_SECTORS,
            max_phys_segments: MAX_PHYS_SEGMENTS,
            max_hw_segments: MAX_HW_SEGMENTS,
            max_segment_size: MAX_SEGMENT_SIZE,
            seg_boundary_mask: SEG_BOUNDARY_MASK,
            hardsect_size: HARDSECT_SIZE,

            bounce_pfn: memory_constants::MAX_LOW_PFN,
            vmerge_boundary: 0,
        }
    }
}

impl QueueLimits {
    pub fn set_max_sectors(&mut self, max_sectors: u32) {
        let min = 1u32 << (PAGE_SHIFT - SECTOR_SHIFT);
        if max_sectors < min {
            info!("set_max_sectors: set to minimum {}", min);
            self.max_sectors = min;
        } else {
            self.max_sectors = max_sectors;
        }
    }

    pub fn set_max_phys_segments(&mut self, max_segments: u16) {
        if max_segments == 0 {
            info!("set_max_phys_segments: set to minimum 1");
        }
        self.max_phys_segments = max_segments.max(1);
    }

    pub fn set_max_hw_segments(&mut self, max_segments: u16) {
        if max_segments == 0 {
            info!("set_max_hw_segments: set to minimum 1");
        }
        self.max_hw_segments = max_segments.max(1);
    }

    pub fn set_max_segment_size(&mut self, max_size: u32) {
        if (max_size as usize) < PAGE_SIZE {
            info!("set_max_segment_size: set to minimum {}", PAGE_SIZE);
            self.max_segment_size = PAGE_SIZE as u32;
        } else {
            self.max_segment_size = max_size;
        }
    }

    pub fn set_segment_boundary(&mut self, mask: u64) {
        let min = PAGE_SIZE as u64 - 1;
        if mask < min {
            info!("set_segment_boundary: set to minimum {:#x}", min);
            self.seg_boundary_mask = min;
        } else {
            self.seg_boundary_mask = mask;
        }
    }

    pub fn set_hardsect_size(&mut self, size: u32) {
        self.hardsect_size = size;
    }

    pub fn set_bounce_limit(&mut self, dma_addr: u64) {
        self.bounce_pfn = dma_addr >> PAGE_SHIFT;
    }

    // Stacked drivers inherit the tightest limits of their components.
    pub fn stack(&mut self, bottom: &QueueLimits) {
        self.max_sectors = self.max_sectors.min(bottom.max_sectors);
        self.max_phys_segments = self.max_phys_segments.min(bottom.max_phys_segments);
        self.max_hw_segments = self.max_hw_segments.min(bottom.max_hw_segments);
        self.max_segment_size = self.max_segment_size.min(bottom.max_segment_size);
        self.hardsect_size = self.hardsect_size.max(bottom.hardsect_size);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlugConfig {
    pub unplug_thresh: usize,
    pub unplug_delay: Duration,
}

impl Default for PlugConfig {
    fn default() -> Self {
        Self {
            unplug_thresh: UNPLUG_THRESH,
            unplug_delay: Duration::from_millis(UNPLUG_DELAY_MS),
        }
    }
}

// Bounds of the window in which a woken allocator may bypass a full pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_requests: u32,
    pub batch_time: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_requests: batch_constants::BLK_BATCH_REQ,
            batch_time: Duration::from_millis(batch_constants::BLK_BATCH_TIME_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub nr_requests: usize,
    pub limits: QueueLimits,
    pub plug: PlugConfig,
    pub batch: BatchConfig,
    pub cluster: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nr_requests: BLKDEV_MAX_RQ,
            limits: QueueLimits::default(),
            plug: PlugConfig::default(),
            batch: BatchConfig::default(),
            cluster: true,
        }
    }
}
