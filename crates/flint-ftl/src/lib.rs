//! Flash translation layer: page-level mapping, wear-ordered free pool,
//! and garbage collection.

pub mod block;
pub mod mapping;

pub use block::{Block, PageState};
pub use mapping::{LpnRange, PageMapping};
