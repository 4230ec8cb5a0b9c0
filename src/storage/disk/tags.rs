use log::{error, info};

use super::request::RequestId;

const BITS_PER_WORD: usize = u64::BITS as usize;

fn words_for(depth: usize) -> usize {
    depth.div_ceil(BITS_PER_WORD)
}

// Tag allocation for drivers with hardware command queueing. Bits past
// `max_depth` in the last word stay set so they are never handed out.
#[derive(Debug)]
pub struct TagTable {
    tag_index: Vec<Option<RequestId>>,
    tag_map: Vec<u64>,
    max_depth: usize,
    real_max_depth: usize,
    busy: Vec<RequestId>,
}

impl TagTable {
    pub fn new(depth: usize, nr_requests: usize) -> Self {
        let mut depth = depth.max(1);
        if depth > nr_requests * 2 {
            depth = nr_requests * 2;
            info!("tag depth clamped to {}", depth);
        }

        let mut table = Self {
            tag_index: Vec::new(),
            tag_map: Vec::new(),
            max_depth: 0,
            real_max_depth: 0,
            busy: Vec::new(),
        };
        table.init_map(depth);
        table
    }

    fn init_map(&mut self, depth: usize) {
        let words = words_for(depth);
        let real_depth = words * BITS_PER_WORD;

        self.tag_index.resize(real_depth, None);
        self.tag_map.resize(words, 0);

        for bit in depth..real_depth {
            self.tag_map[bit / BITS_PER_WORD] |= 1 << (bit % BITS_PER_WORD);
        }

        self.max_depth = depth;
        self.real_max_depth = real_depth;
    }

    // Only grows; shrinking requests are ignored.
    pub fn resize(&mut self, new_depth: usize) -> bool {
        if new_depth <= self.max_depth {
            return false;
        }

        let old_depth = self.max_depth;
        let old_words = self.tag_map.len();
        let words = words_for(new_depth);
        let real_depth = words * BITS_PER_WORD;

        // free the padding bits of the old last word first
        for bit in old_depth..old_words * BITS_PER_WORD {
            if self.tag_index[bit].is_none() {
                self.tag_map[bit / BITS_PER_WORD] &= !(1 << (bit % BITS_PER_WORD));
            }
        }

        self.tag_index.resize(real_depth, None);
        self.tag_map.resize(words, 0);
        for bit in new_depth..real_depth {
            self.tag_map[bit / BITS_PER_WORD] |= 1 << (bit % BITS_PER_WORD);
        }

        self.max_depth = new_depth;
        self.real_max_depth = real_depth;
        true
    }

    pub fn depth(&self) -> usize {
        self.max_depth
    }

    pub fn real_depth(&self) -> usize {
        self.real_max_depth
    }

    pub fn busy(&self) -> usize {
        self.busy.len()
    }

    pub fn busy_list(&self) -> &[RequestId] {
        &self.busy
    }

    pub fn bitmap(&self) -> &[u64] {
        &self.tag_map
    }

    pub fn find(&self, tag: usize) -> Option<RequestId> {
        if tag >= self.max_depth {
            return None;
        }
        self.tag_index[tag]
    }

    fn first_free(&self) -> Option<usize> {
        self.tag_map
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * BITS_PER_WORD + word.trailing_ones() as usize)
            .filter(|&tag| tag < self.max_depth)
    }

    pub(crate) fn start(&mut self, rq: RequestId) -> Option<usize> {
        let tag = self.first_free()?;

        self.tag_map[tag / BITS_PER_WORD] |= 1 << (tag % BITS_PER_WORD);
        self.tag_index[tag] = Some(rq);
        self.busy.push(rq);
        Some(tag)
    }

    pub(crate) fn end(&mut self, tag: usize, rq: RequestId) {
        if tag >= self.real_max_depth {
            error!("end_tag: tag {} out of range", tag);
            return;
        }

        let word = &mut self.tag_map[tag / BITS_PER_WORD];
        let bit = 1u64 << (tag % BITS_PER_WORD);
        if *word & bit == 0 {
            error!("end_tag: attempt to clear non-busy tag ({})", tag);
            return;
        }
        *word &= !bit;

        if self.tag_index[tag].is_none() {
            error!("end_tag: tag {} has no request", tag);
        }
        self.tag_index[tag] = None;
        self.busy.retain(|&id| id != rq);
    }
}
