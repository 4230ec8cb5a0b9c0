pub mod completion;
pub mod percpu;
pub mod wait;
