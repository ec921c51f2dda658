//! Archive backend implementations.

pub mod loopback;
pub mod memory;
