//! Core simulation primitives shared by every Flint crate: the discrete
//! event engine, the firmware CPU latency model, NAND geometry, and the
//! INI configuration loader.
//!
//! Picoseconds are the universal time unit. Every component reads the same
//! monotonic tick from the [`Engine`].

pub mod checkpoint;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod geometry;

pub use config::{ConfigError, SimConfig};
pub use engine::{Engine, EventId, Fired, Tick, INVALID_EVENT};
pub use geometry::{AddrAxis, Geometry, NandType};
