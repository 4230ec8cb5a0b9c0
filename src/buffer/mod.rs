pub mod buffer_cache;
pub mod buffer_head;
pub mod flusher;
pub mod lru;
pub mod page_buffers;
