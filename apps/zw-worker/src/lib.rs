pub mod config;
pub mod coordinator;
pub mod scheduler;
pub mod singleflight;
