//! Host interface layer: NVMe wire formats, DMA engine, interrupt
//! coalescing, command arbitration, controller registers, and the
//! subsystem glue that drives commands through the cache, FTL and PAL.

pub mod arbitrator;
pub mod coalescer;
pub mod controller;
pub mod convert;
pub mod dma;
pub mod nvme;
pub mod queue;
pub mod subsystem;

pub use arbitrator::{ArbiterConfig, ArbiterEvents, Arbitration, Arbitrator, SqContext};
pub use coalescer::{InterruptCoalescer, InterruptSink};
pub use controller::NvmeController;
pub use convert::{LbaConverter, LpnRangeInfo};
pub use dma::{DmaEngine, DmaError, DmaTag, HostInterface, PhysicalRegion};
pub use nvme::{CqEntry, SqEntry, Status};
pub use queue::{CompQueue, QueuePriority, SubQueue};
pub use subsystem::Subsystem;
