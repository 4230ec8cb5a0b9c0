pub mod bio;
pub mod bounce;
pub mod congestion;
pub mod device;
pub mod elevator;
pub mod io_context;
pub mod queue;
pub mod ramdisk;
pub mod request;
pub mod scheduler;
pub mod segments;
pub mod tags;
