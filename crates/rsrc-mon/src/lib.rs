//! Real-time load monitor for the encoder and decoder modules shared through
//! the host-wide device pool.

pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod query;
pub mod report;
pub mod selector;
