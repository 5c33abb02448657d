mod build_info;
pub mod logging;
pub mod shared_memory;
pub mod version;
