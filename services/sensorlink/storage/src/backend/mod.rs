//! Sink backend implementations

pub mod channel;
pub mod file;
pub mod mem;
