use std::sync::Arc;

use crate::{config::QueueLimits, storage::page::Page};

use super::{
    bio::{Bio, BioVec},
    request::{Request, RequestFlags},
};

// One entry of a scatter/gather list handed to a DMA engine.
#[derive(Debug, Clone)]
pub struct ScatterEntry {
    pub page: Arc<Page>,
    pub offset: usize,
    pub length: usize,
}

// Segment accounting for one queue: how many physical (after clustering) and
// hardware (after virtual merging) segments a bio or request needs.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRules {
    pub limits: QueueLimits,
    pub cluster: bool,
}

fn phys_mergeable(a: &BioVec, b: &BioVec) -> bool {
    a.end_addr() == b.phys_addr()
}

impl SegmentRules {
    pub fn new(limits: QueueLimits, cluster: bool) -> Self {
        Self { limits, cluster }
    }

    fn virt_mergeable(&self, a: &BioVec, b: &BioVec) -> bool {
        let boundary = self.limits.vmerge_boundary;
        boundary != 0 && ((a.end_addr() | b.phys_addr()) & (boundary - 1)) == 0
    }

    // True if [start, end) stays inside one boundary window.
    fn within_boundary(&self, start: u64, end: u64) -> bool {
        let mask = self.limits.seg_boundary_mask;
        (start | mask) == ((end - 1) | mask)
    }

    fn is_high(&self, vec: &BioVec) -> bool {
        vec.page.pfn() >= self.limits.bounce_pfn
    }

    pub fn recount_segments(&self, bio: &Bio) -> (u16, u16) {
        let mut nr_phys = 0u16;
        let mut nr_hw = 0u16;
        let mut seg_size = 0usize;
        let mut highprv = false;
        let mut prev: Option<&BioVec> = None;

        for vec in bio.segments() {
            let high = self.is_high(vec);

            if !(high || highprv) {
                if let (Some(bvprv), true) = (prev, self.cluster) {
                    if seg_size + vec.len <= self.limits.max_segment_size as usize
                        && phys_mergeable(bvprv, vec)
                        && self.within_boundary(bvprv.phys_addr(), vec.end_addr())
                    {
                        seg_size += vec.len;
                        prev = Some(vec);
                        continue;
                    }
                }
            }

            let hw_merge = !(high || highprv)
                && prev.map_or(false, |bvprv| self.virt_mergeable(bvprv, vec));
            if !hw_merge {
                nr_hw += 1;
            }

            nr_phys += 1;
            prev = Some(vec);
            seg_size = vec.len;
            highprv = high;
        }

        (nr_phys, nr_hw)
    }

    // Counts are cached on the bio until its segment vector changes.
    pub fn bio_segments(&self, bio: &mut Bio) -> (u16, u16) {
        if let Some(counts) = bio.cached_segments() {
            return counts;
        }
        let (phys, hw) = self.recount_segments(bio);
        bio.cache_segments(phys, hw);
        (phys, hw)
    }

    fn bio_span(bio: &Bio) -> Option<(u64, u64)> {
        Some((bio.first_vec()?.phys_addr(), bio.last_vec()?.end_addr()))
    }

    // Last segment of `bio` and first of `nxt` form one physical segment.
    pub fn phys_contig_segment(&self, bio: &Bio, nxt: &Bio) -> bool {
        if !self.cluster {
            return false;
        }
        let (Some(last), Some(first)) = (bio.last_vec(), nxt.first_vec()) else {
            return false;
        };
        if !phys_mergeable(last, first) {
            return false;
        }
        if bio.size() + nxt.size() > self.limits.max_segment_size as usize {
            return false;
        }
        match (Self::bio_span(bio), Self::bio_span(nxt)) {
            (Some((start, _)), Some((_, end))) => self.within_boundary(start, end),
            _ => false,
        }
    }

    pub fn hw_contig_segment(&self, bio: &Bio, nxt: &Bio) -> bool {
        let (Some(last), Some(first)) = (bio.last_vec(), nxt.first_vec()) else {
            return false;
        };
        self.virt_mergeable(last, first)
            && bio.size() + nxt.size() <= self.limits.max_segment_size as usize
    }

    fn new_mergeable(&self, req: &mut Request, nr_phys: u16) -> bool {
        if req.nr_phys_segments + nr_phys > self.limits.max_phys_segments {
            req.flags.insert(RequestFlags::NOMERGE);
            return false;
        }
        req.nr_phys_segments += nr_phys;
        true
    }

    fn new_hw_segment(&self, req: &mut Request, nr_phys: u16, nr_hw: u16) -> bool {
        if req.nr_hw_segments + nr_hw > self.limits.max_hw_segments
            || req.nr_phys_segments + nr_phys > self.limits.max_phys_segments
        {
            req.flags.insert(RequestFlags::NOMERGE);
            return false;
        }
        req.nr_hw_segments += nr_hw;
        req.nr_phys_segments += nr_phys;
        true
    }

    // Admits `bio` at the tail of `req`, charging its segments. On refusal the
    // request is marked unmergeable.
    pub fn back_merge_fn(&self, req: &mut Request, bio: &mut Bio) -> bool {
        if req.nr_sectors + bio.sectors() > self.limits.max_sectors {
            req.flags.insert(RequestFlags::NOMERGE);
            return false;
        }
        let (nr_phys, nr_hw) = self.bio_segments(bio);
        let virt = match (req.bios.back().and_then(|b| b.last_vec()), bio.first_vec()) {
            (Some(last), Some(first)) => self.virt_mergeable(last, first),
            _ => false,
        };
        if virt {
            self.new_mergeable(req, nr_phys)
        } else {
            self.new_hw_segment(req, nr_phys, nr_hw)
        }
    }

    pub fn front_merge_fn(&self, req: &mut Request, bio: &mut Bio) -> bool {
        if req.nr_sectors + bio.sectors() > self.limits.max_sectors {
            req.flags.insert(RequestFlags::NOMERGE);
            return false;
        }
        let (nr_phys, nr_hw) = self.bio_segments(bio);
        let virt = match (bio.last_vec(), req.bios.front().and_then(|b| b.first_vec())) {
            (Some(last), Some(first)) => self.virt_mergeable(last, first),
            _ => false,
        };
        if virt {
            self.new_mergeable(req, nr_phys)
        } else {
            self.new_hw_segment(req, nr_phys, nr_hw)
        }
    }

    // Checks that `next` can be appended to `req` and charges the combined
    // segment counts to `req`.
    pub fn merge_requests_fn(&self, req: &mut Request, next: &Request) -> bool {
        if req.nr_sectors + next.nr_sectors > self.limits.max_sectors {
            return false;
        }
        let (Some(tail), Some(head)) = (req.bios.back(), next.bios.front()) else {
            return false;
        };

        let mut total_phys = req.nr_phys_segments + next.nr_phys_segments;
        if self.phys_contig_segment(tail, head) {
            total_phys -= 1;
        }
        if total_phys > self.limits.max_phys_segments {
            return false;
        }

        let mut total_hw = req.nr_hw_segments + next.nr_hw_segments;
        if self.hw_contig_segment(tail, head) {
            total_hw -= 1;
        }
        if total_hw > self.limits.max_hw_segments {
            return false;
        }

        req.nr_phys_segments = total_phys;
        req.nr_hw_segments = total_hw;
        true
    }

    pub fn recalc_rq_segments(&self, req: &mut Request) {
        let mut nr_phys = 0u16;
        let mut nr_hw = 0u16;

        for i in 0..req.bios.len() {
            let (phys, hw) = self.bio_segments(&mut req.bios[i]);
            nr_phys += phys;
            nr_hw += hw;
            if i > 0 {
                if self.phys_contig_segment(&req.bios[i - 1], &req.bios[i]) {
                    nr_phys -= 1;
                }
                if self.hw_contig_segment(&req.bios[i - 1], &req.bios[i]) {
                    nr_hw -= 1;
                }
            }
        }

        req.nr_phys_segments = nr_phys;
        req.nr_hw_segments = nr_hw;
    }

    // Builds the scatter list for `req`, one entry per physical segment.
    pub fn map_sg(&self, req: &Request) -> Vec<ScatterEntry> {
        let mut sg: Vec<ScatterEntry> = Vec::new();
        let mut prev: Option<&BioVec> = None;

        for vec in req.bios.iter().flat_map(|bio| bio.segments()) {
            if let (Some(bvprv), true, Some(last)) = (prev, self.cluster, sg.last_mut()) {
                if last.length + vec.len <= self.limits.max_segment_size as usize
                    && phys_mergeable(bvprv, vec)
                    && self.within_boundary(bvprv.phys_addr(), vec.end_addr())
                {
                    last.length += vec.len;
                    prev = Some(vec);
                    continue;
                }
            }

            sg.push(ScatterEntry {
                page: Arc::clone(&vec.page),
                offset: vec.offset,
                length: vec.len,
            });
            prev = Some(vec);
        }

        sg
    }
}
