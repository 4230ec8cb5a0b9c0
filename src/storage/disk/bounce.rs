use std::sync::Arc;

use log::debug;

use crate::storage::page::{Page, Zone};

use super::bio::{Bio, BioFlags, Direction};

struct BouncePair {
    orig: Arc<Page>,
    bounce: Arc<Page>,
    offset: usize,
    len: usize,
}

// Replaces segments whose frames lie at or above `bounce_pfn` with low-memory
// copies. Writes are copied before submission, reads are copied back on
// completion, and the original bio completes when the bounced one does.
pub fn blk_queue_bounce(bounce_pfn: u64, bio: Bio) -> Bio {
    if !bio.segments().iter().any(|v| v.page.pfn() >= bounce_pfn) {
        return bio;
    }

    let dir = bio.dir();
    let mut bounced = Bio::new(Arc::clone(bio.bdev()), bio.sector(), dir);
    bounced.set_flags(bio.flags() & (BioFlags::BARRIER | BioFlags::AHEAD));
    bounced.set_flags(BioFlags::BOUNCED);

    let mut pairs = Vec::new();
    for vec in bio.segments() {
        if vec.page.pfn() < bounce_pfn {
            bounced.add_page(Arc::clone(&vec.page), vec.len, vec.offset);
            continue;
        }

        let low = Page::alloc(Zone::Normal);
        if dir == Direction::Write {
            let mut tmp = vec![0u8; vec.len];
            vec.page.copy_to(vec.offset, &mut tmp);
            low.copy_from(vec.offset, &tmp);
        }
        bounced.add_page(Arc::clone(&low), vec.len, vec.offset);
        pairs.push(BouncePair {
            orig: Arc::clone(&vec.page),
            bounce: low,
            offset: vec.offset,
            len: vec.len,
        });
    }

    debug!(
        "bounce: sector {} {} of {} segments copied",
        bio.sector(),
        pairs.len(),
        bio.segments().len()
    );

    let orig = bio;
    bounced.with_end_io(move |done: Bio| {
        let status = done.status();
        if dir == Direction::Read && status.is_ok() {
            for pair in &pairs {
                let mut tmp = vec![0u8; pair.len];
                pair.bounce.copy_to(pair.offset, &mut tmp);
                pair.orig.copy_from(pair.offset, &tmp);
            }
        }
        match status {
            Ok(()) => {
                let mut orig = orig;
                let bytes = orig.size();
                orig.advance(bytes, None);
                orig.complete();
            }
            Err(err) => orig.endio(err),
        }
    })
}
