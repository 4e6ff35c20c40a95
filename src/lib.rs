pub mod memory;
pub mod trace;

pub mod error;
