pub mod disk;
pub mod mapping;
pub mod page;
