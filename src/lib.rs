//! Block I/O request layer and buffer cache.
//!
//! `storage::disk` turns bios into coalesced requests on a per-device
//! [`RequestQueue`](storage::disk::queue::RequestQueue) and hands them to a
//! driver. `buffer` maps fixed-size disk blocks onto pages and drives
//! writeback and fsync through the request layer.

pub mod buffer;
pub mod config;
pub mod error;
pub mod storage;
pub mod utils;

pub use error::{BlkError, BlkResult, IoStatus};

#[cfg(test)]
mod tests;
