//! Flint machine: assembles the event engine, firmware CPU model, NVMe
//! controller, and the cache/FTL/PAL stack into one simulated SSD.

pub mod host;
pub mod snapshot;
pub mod ssd;

pub use host::{HostMemory, IrqLog};
pub use ssd::{Ssd, SsdEvent};
