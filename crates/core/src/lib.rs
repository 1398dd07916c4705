//! GameWire Core - Fundamental types and utilities

mod error;
mod idgen;
mod types;

pub use error::*;
pub use idgen::*;
pub use types::*;
