//! Physical abstraction layer: NAND timing tables, address conversion, and
//! the per-channel / per-die timeline scheduler with its statistics.

pub mod convert;
pub mod pal;
pub mod scheduler;
pub mod stats;
pub mod timeline;
pub mod timing;

pub use convert::{AddressConverter, PhysAddr};
pub use pal::{Pal, PalRequest, FLUSH_PERIOD, FLUSH_RANGE};
pub use scheduler::{NandCommand, ScheduleResult, TimelineScheduler};
pub use stats::{ActiveTime, Conflict, EpochSnapshot, PalStats, PhaseTimes};
pub use timeline::{TimeSlot, Timeline};
pub use timing::{PageType, PalOp, PalPhase, TimingTable};
