//! FTL-facing PAL front-end.
//!
//! The FTL addresses superblocks: one `(block, page)` pair plus an I/O map
//! selecting lanes of the superpage. This layer expands each request into
//! per-die physical page addresses under the configured allocation order,
//! submits them to the timeline scheduler, and folds the result back into
//! the caller's tick.

use flint_core::geometry::AddrAxis;
use flint_core::{Geometry, Tick};
use tracing::debug;

use crate::convert::{AddressConverter, PhysAddr};
use crate::scheduler::{NandCommand, TimelineScheduler};
use crate::stats::{ActiveTime, PalStats};
use crate::timing::{PalOp, TimingTable};

/// Timeline maintenance cadence: fold slots every 0.1 simulated seconds,
/// keeping a 0.01 s window before `now`.
pub const FLUSH_PERIOD: Tick = 100_000_000_000;
pub const FLUSH_RANGE: Tick = 10_000_000_000;

/// One FTL request against a superblock.
#[derive(Debug, Clone)]
pub struct PalRequest {
    /// Superblock index.
    pub block: u64,
    /// Page within each fused physical block.
    pub page: u32,
    /// Which lanes of the superpage participate; length equals the
    /// superblock degree.
    pub io_map: Vec<bool>,
}

impl PalRequest {
    pub fn full(block: u64, page: u32, degree: u32) -> Self {
        Self {
            block,
            page,
            io_map: vec![true; degree as usize],
        }
    }
}

pub struct Pal {
    geometry: Geometry,
    converter: AddressConverter,
    scheduler: TimelineScheduler,
    stats: PalStats,
    /// Axes fused into the superblock, fastest first.
    fused: Vec<AddrAxis>,
}

impl Pal {
    pub fn new(geometry: Geometry, timing: TimingTable) -> Self {
        let fused = geometry
            .superblock_axes()
            .expect("geometry validated at config load")
            .to_vec();

        let scheduler = TimelineScheduler::new(
            geometry.channels,
            geometry.total_dies() as u32,
            timing,
        );

        Self {
            converter: AddressConverter::new(&geometry),
            scheduler,
            stats: PalStats::new(),
            fused,
            geometry,
        }
    }

    pub fn read(&mut self, req: &PalRequest, tick: &mut Tick) {
        self.submit(PalOp::Read, req, tick);
    }

    pub fn write(&mut self, req: &PalRequest, tick: &mut Tick) {
        self.submit(PalOp::Write, req, tick);
    }

    /// Erase the whole superblock; `req.page` is ignored.
    pub fn erase(&mut self, req: &PalRequest, tick: &mut Tick) {
        self.submit(PalOp::Erase, req, tick);
    }

    fn submit(&mut self, op: PalOp, req: &PalRequest, tick: &mut Tick) {
        assert_eq!(
            req.io_map.len(),
            self.geometry.pages_in_superpage() as usize,
            "I/O map does not cover the superpage"
        );

        let size = match op {
            PalOp::Erase => {
                u64::from(self.geometry.page_size_bytes)
                    * u64::from(self.geometry.pages_per_block)
            }
            _ => u64::from(self.geometry.page_size_bytes),
        };

        let arrived = *tick;
        let mut finished = arrived;

        for addr in self.expand(req) {
            let mut cmd = NandCommand::new(
                arrived,
                self.converter.compose(&addr),
                op,
                size,
            );

            let die_index = self.converter.die_index(&addr);
            let result = self.scheduler.submit(&mut cmd, &addr, die_index);

            self.stats.add_command(
                self.scheduler.timing(),
                op,
                self.scheduler.timing().page_type(addr.page),
                &result.times,
                result.conflict,
                size,
                arrived,
            );

            finished = finished.max(cmd.finished);
        }

        debug!(?op, block = req.block, page = req.page, arrived, finished, "pal submit");

        *tick = finished;
    }

    /// Expand a superblock request into the physical page of every selected
    /// lane. Non-fused axes are demultiplexed from the superblock index in
    /// allocation order; fused axes fan out, fastest first.
    fn expand(&self, req: &PalRequest) -> Vec<PhysAddr> {
        let mut addr = PhysAddr {
            page: req.page,
            ..PhysAddr::default()
        };

        let mut rest = req.block;

        for axis in self.geometry.page_allocation_order {
            if self.fused.contains(&axis) {
                continue;
            }

            let size = u64::from(self.geometry.axis_size(axis));
            let value = (rest % size) as u32;
            rest /= size;

            match axis {
                AddrAxis::Channel => addr.channel = value,
                AddrAxis::Way => addr.way = value,
                AddrAxis::Die => addr.die = value,
                AddrAxis::Plane => addr.plane = value,
            }
        }

        assert!(
            rest < u64::from(self.geometry.blocks_per_plane),
            "superblock index {} out of range",
            req.block
        );
        addr.block = rest as u32;

        let mut out = Vec::new();
        let mut lane = 0usize;
        let mut cursor = vec![0u32; self.fused.len()];

        loop {
            if req.io_map[lane] {
                let mut target = addr;

                for (axis, &value) in self.fused.iter().zip(&cursor) {
                    match axis {
                        AddrAxis::Channel => target.channel = value,
                        AddrAxis::Way => target.way = value,
                        AddrAxis::Die => target.die = value,
                        AddrAxis::Plane => target.plane = value,
                    }
                }

                out.push(target);
            }

            lane += 1;

            // Odometer over the fused axes, first axis fastest.
            let mut idx = 0;
            loop {
                if idx == self.fused.len() {
                    debug_assert_eq!(lane, req.io_map.len());
                    return out;
                }

                cursor[idx] += 1;

                if cursor[idx] < self.geometry.axis_size(self.fused[idx]) {
                    break;
                }

                cursor[idx] = 0;
                idx += 1;
            }
        }
    }

    pub fn flush_time_slots(&mut self, cut: Tick) {
        self.scheduler.flush_time_slots(cut);
        self.stats.rollover(cut);
    }

    pub fn converter(&self) -> &AddressConverter {
        &self.converter
    }

    pub fn scheduler(&self) -> &TimelineScheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> &PalStats {
        &self.stats
    }

    pub fn channel_active_time(&self) -> ActiveTime {
        ActiveTime::from_busy_ticks(self.scheduler.channel_busy_totals())
    }

    pub fn die_active_time(&self) -> ActiveTime {
        ActiveTime::from_busy_ticks(self.scheduler.die_busy_totals())
    }

    /// Serialize the timeline ledgers and accumulated statistics. The
    /// converter and fan-out tables are derived from geometry and carry no
    /// state of their own.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        self.scheduler.save(w)?;
        self.stats.save(w)
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> std::io::Result<()> {
        self.scheduler.restore(r)?;
        self.stats.restore(r)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint_core::NandType;
    use crate::timing::TimingTable;

    fn geometry(channels: u32, degree: u32) -> Geometry {
        Geometry {
            channels,
            ways_per_channel: 2,
            dies_per_way: 1,
            planes_per_die: 1,
            blocks_per_plane: 8,
            pages_per_block: 16,
            page_size_bytes: 4096,
            nand_type: NandType::Slc,
            dma_speed_mtps: 400,
            dma_width_bits: 8,
            superblock_degree: degree,
            page_allocation_order: [
                AddrAxis::Channel,
                AddrAxis::Way,
                AddrAxis::Die,
                AddrAxis::Plane,
            ],
            use_multi_plane: false,
        }
    }

    fn timing() -> TimingTable {
        TimingTable::from_phases(
            NandType::Slc,
            (1_000_000, 58_000_000, 2_000_000),
            (1_000_000, 500_000_000, 1_000_000),
            (1_000_000, 2_000_000_000),
        )
    }

    #[test]
    fn plain_blocks_demultiplex_across_axes() {
        let pal = Pal::new(geometry(4, 1), timing());

        // block 0 -> channel 0, way 0; block 1 -> channel 1.
        let addrs = pal.expand(&PalRequest::full(1, 3, 1));
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].channel, 1);
        assert_eq!(addrs[0].page, 3);

        // 4 channels * 2 ways fused into the index before the plane block.
        let addrs = pal.expand(&PalRequest::full(5, 0, 1));
        assert_eq!(addrs[0].channel, 1);
        assert_eq!(addrs[0].way, 1);
    }

    #[test]
    fn superblock_request_fans_out_over_fused_axes() {
        let pal = Pal::new(geometry(4, 4), timing());

        let addrs = pal.expand(&PalRequest::full(0, 0, 4));
        assert_eq!(addrs.len(), 4);

        let channels: Vec<u32> = addrs.iter().map(|a| a.channel).collect();
        assert_eq!(channels, vec![0, 1, 2, 3]);
    }

    #[test]
    fn io_map_masks_lanes() {
        let pal = Pal::new(geometry(4, 4), timing());

        let req = PalRequest {
            block: 0,
            page: 0,
            io_map: vec![true, false, false, true],
        };

        let addrs = pal.expand(&req);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].channel, 0);
        assert_eq!(addrs[1].channel, 3);
    }

    #[test]
    fn fanned_out_lanes_land_on_parallel_resources() {
        let mut pal = Pal::new(geometry(4, 4), timing());
        let mut tick = 0;

        pal.write(&PalRequest::full(0, 0, 4), &mut tick);

        // All four lanes program in parallel on distinct channels.
        assert_eq!(tick, 502_000_000);
        assert_eq!(pal.stats().count(PalOp::Write), 4);
    }

    #[test]
    fn lone_write_and_read_cost_their_phases() {
        let mut pal = Pal::new(geometry(1, 1), timing());

        let mut tick = 0;
        pal.write(&PalRequest::full(0, 0, 1), &mut tick);
        assert_eq!(tick, 502_000_000);

        pal.read(&PalRequest::full(0, 0, 1), &mut tick);
        assert_eq!(tick, 502_000_000 + 61_000_000);
    }

    #[test]
    fn checkpoint_round_trips_ledgers_and_stats() {
        let mut pal = Pal::new(geometry(4, 1), timing());
        let mut tick = 0;

        pal.write(&PalRequest::full(0, 0, 1), &mut tick);
        pal.read(&PalRequest::full(0, 0, 1), &mut tick);
        pal.write(&PalRequest::full(5, 1, 1), &mut tick);

        let mut image = Vec::new();
        pal.save(&mut image).unwrap();

        let mut other = Pal::new(geometry(4, 1), timing());
        other.restore(&mut image.as_slice()).unwrap();

        assert_eq!(other.stats().count(PalOp::Write), 2);
        assert_eq!(other.stats().count(PalOp::Read), 1);
        assert_eq!(
            other.scheduler().channel_busy_totals(),
            pal.scheduler().channel_busy_totals()
        );
        assert_eq!(
            other.scheduler().channel_slots(0),
            pal.scheduler().channel_slots(0)
        );

        // A restored ledger keeps scheduling where the old one left off.
        let mut resumed = tick;
        other.write(&PalRequest::full(0, 1, 1), &mut resumed);

        let mut expected = tick;
        pal.write(&PalRequest::full(0, 1, 1), &mut expected);

        assert_eq!(resumed, expected);
    }

    #[test]
    fn erase_accounts_whole_block_bytes() {
        let mut pal = Pal::new(geometry(1, 1), timing());
        let mut tick = 0;

        pal.erase(&PalRequest::full(0, 0, 1), &mut tick);

        assert_eq!(tick, 2_001_000_000);
        assert_eq!(pal.stats().bytes(PalOp::Erase), 4096 * 16);
    }
}
