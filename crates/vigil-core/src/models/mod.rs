//! Data models for Vigil

mod status;
mod tags;

pub use status::*;
pub use tags::*;
