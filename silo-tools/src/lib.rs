//! Tools and helpers shared by the silodb crates.

pub mod fs;
pub mod io;
pub mod lru_cache;
