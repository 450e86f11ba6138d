//! PAL statistics: per-phase tick sums, conflict counts, energy, and
//! rolling epoch snapshots for IOPS/bandwidth reporting.

use flint_core::Tick;

use crate::timing::{PageType, PalOp, PalPhase, TimingTable};

/// Ticks spent in each phase of one scheduled NAND command, waits included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimes {
    pub dma0_wait: Tick,
    pub dma0: Tick,
    pub mem: Tick,
    pub dma1_wait: Tick,
    pub dma1: Tick,
}

impl PhaseTimes {
    pub fn total(&self) -> Tick {
        self.dma0_wait + self.dma0 + self.mem + self.dma1_wait + self.dma1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    None,
    Dma0Channel,
    Dma0Mem,
    Dma1,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictCounts {
    pub none: u64,
    pub dma0_channel: u64,
    pub dma0_mem: u64,
    pub dma1: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accum {
    count: u64,
    ticks: PhaseTimes,
    total_ticks: Tick,
    energy_dma0_pj: f64,
    energy_mem_pj: f64,
    energy_dma1_pj: f64,
    bytes: u64,
}

impl Accum {
    fn add(&mut self, times: &PhaseTimes, energy: (f64, f64, f64), bytes: u64) {
        self.count += 1;
        self.ticks.dma0_wait += times.dma0_wait;
        self.ticks.dma0 += times.dma0;
        self.ticks.mem += times.mem;
        self.ticks.dma1_wait += times.dma1_wait;
        self.ticks.dma1 += times.dma1;
        self.total_ticks += times.total();
        self.energy_dma0_pj += energy.0;
        self.energy_mem_pj += energy.1;
        self.energy_dma1_pj += energy.2;
        self.bytes += bytes;
    }
}

/// Min/avg/max across a set of resources (channels or dies).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActiveTime {
    pub min: f64,
    pub average: f64,
    pub max: f64,
}

impl ActiveTime {
    pub fn from_busy_ticks(values: impl IntoIterator<Item = Tick>) -> Self {
        let mut min = f64::MAX;
        let mut max: f64 = 0.0;
        let mut sum: f64 = 0.0;
        let mut count = 0u64;

        for v in values {
            let v = v as f64;

            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }

        if count == 0 {
            return Self::default();
        }

        Self {
            min,
            average: sum / count as f64,
            max,
        }
    }
}

/// One closed accounting epoch (0.1 simulated seconds).
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochSnapshot {
    pub start: Tick,
    pub end: Tick,
    /// Commands retired per op during the epoch.
    pub ops: [u64; 3],
    /// Bytes accessed per op during the epoch.
    pub bytes: [u64; 3],
}

impl EpochSnapshot {
    pub fn iops(&self) -> f64 {
        let seconds = (self.end - self.start) as f64 / 1e12;

        if seconds == 0.0 {
            return 0.0;
        }

        self.ops.iter().sum::<u64>() as f64 / seconds
    }

    pub fn bandwidth_bytes_per_sec(&self) -> f64 {
        let seconds = (self.end - self.start) as f64 / 1e12;

        if seconds == 0.0 {
            return 0.0;
        }

        self.bytes.iter().sum::<u64>() as f64 / seconds
    }
}

pub const EPOCH_INTERVAL: Tick = 100_000_000_000;

/// How many closed epochs to retain for rolling reports.
const EPOCH_RING: usize = 64;

#[derive(Debug)]
pub struct PalStats {
    // Indexed [op][page type].
    accum: [[Accum; 3]; 3],
    conflicts: [ConflictCounts; 3],
    epoch_start: Tick,
    epoch_ops: [u64; 3],
    epoch_bytes: [u64; 3],
    epochs: Vec<EpochSnapshot>,
}

impl PalStats {
    pub fn new() -> Self {
        Self {
            accum: [[Accum::default(); 3]; 3],
            conflicts: [ConflictCounts::default(); 3],
            epoch_start: 0,
            epoch_ops: [0; 3],
            epoch_bytes: [0; 3],
            epochs: Vec::new(),
        }
    }

    pub fn add_command(
        &mut self,
        timing: &TimingTable,
        op: PalOp,
        page_type: PageType,
        times: &PhaseTimes,
        conflict: Conflict,
        bytes: u64,
        now: Tick,
    ) {
        self.rollover(now);

        // power[phase] in nW times time[phase] in ps, scaled to pJ.
        let energy = (
            timing.power(op, PalPhase::Dma0) as f64 * times.dma0 as f64 / 1e9,
            timing.power(op, PalPhase::Mem) as f64 * times.mem as f64 / 1e9,
            timing.power(op, PalPhase::Dma1) as f64 * times.dma1 as f64 / 1e9,
        );

        self.accum[op.index()][page_type.index()].add(times, energy, bytes);

        let conflicts = &mut self.conflicts[op.index()];
        match conflict {
            Conflict::None => conflicts.none += 1,
            Conflict::Dma0Channel => conflicts.dma0_channel += 1,
            Conflict::Dma0Mem => conflicts.dma0_mem += 1,
            Conflict::Dma1 => conflicts.dma1 += 1,
        }

        self.epoch_ops[op.index()] += 1;
        self.epoch_bytes[op.index()] += bytes;
    }

    /// Close any epochs that ended before `now`.
    pub fn rollover(&mut self, now: Tick) {
        while now >= self.epoch_start + EPOCH_INTERVAL {
            self.epochs.push(EpochSnapshot {
                start: self.epoch_start,
                end: self.epoch_start + EPOCH_INTERVAL,
                ops: self.epoch_ops,
                bytes: self.epoch_bytes,
            });

            if self.epochs.len() > EPOCH_RING {
                self.epochs.remove(0);
            }

            self.epoch_start += EPOCH_INTERVAL;
            self.epoch_ops = [0; 3];
            self.epoch_bytes = [0; 3];
        }
    }

    pub fn count(&self, op: PalOp) -> u64 {
        self.accum[op.index()].iter().map(|a| a.count).sum()
    }

    pub fn count_by_page_type(&self, op: PalOp, page_type: PageType) -> u64 {
        self.accum[op.index()][page_type.index()].count
    }

    pub fn phase_ticks(&self, op: PalOp) -> PhaseTimes {
        let mut out = PhaseTimes::default();

        for a in &self.accum[op.index()] {
            out.dma0_wait += a.ticks.dma0_wait;
            out.dma0 += a.ticks.dma0;
            out.mem += a.ticks.mem;
            out.dma1_wait += a.ticks.dma1_wait;
            out.dma1 += a.ticks.dma1;
        }

        out
    }

    pub fn conflicts(&self, op: PalOp) -> ConflictCounts {
        self.conflicts[op.index()]
    }

    pub fn energy_pj(&self, op: PalOp) -> f64 {
        self.accum[op.index()]
            .iter()
            .map(|a| a.energy_dma0_pj + a.energy_mem_pj + a.energy_dma1_pj)
            .sum()
    }

    pub fn total_energy_pj(&self) -> f64 {
        PalOp::ALL.iter().map(|&op| self.energy_pj(op)).sum()
    }

    pub fn bytes(&self, op: PalOp) -> u64 {
        self.accum[op.index()].iter().map(|a| a.bytes).sum()
    }

    pub fn epochs(&self) -> &[EpochSnapshot] {
        &self.epochs
    }

    /// Serialize accumulators, conflict counters, and the epoch ring.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_f64, write_u64};

        for per_op in &self.accum {
            for a in per_op {
                write_u64(w, a.count)?;
                write_u64(w, a.ticks.dma0_wait)?;
                write_u64(w, a.ticks.dma0)?;
                write_u64(w, a.ticks.mem)?;
                write_u64(w, a.ticks.dma1_wait)?;
                write_u64(w, a.ticks.dma1)?;
                write_u64(w, a.total_ticks)?;
                write_f64(w, a.energy_dma0_pj)?;
                write_f64(w, a.energy_mem_pj)?;
                write_f64(w, a.energy_dma1_pj)?;
                write_u64(w, a.bytes)?;
            }
        }

        for c in &self.conflicts {
            write_u64(w, c.none)?;
            write_u64(w, c.dma0_channel)?;
            write_u64(w, c.dma0_mem)?;
            write_u64(w, c.dma1)?;
        }

        write_u64(w, self.epoch_start)?;
        for op in 0..3 {
            write_u64(w, self.epoch_ops[op])?;
            write_u64(w, self.epoch_bytes[op])?;
        }

        write_u64(w, self.epochs.len() as u64)?;
        for epoch in &self.epochs {
            write_u64(w, epoch.start)?;
            write_u64(w, epoch.end)?;
            for op in 0..3 {
                write_u64(w, epoch.ops[op])?;
                write_u64(w, epoch.bytes[op])?;
            }
        }

        Ok(())
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> std::io::Result<()> {
        use flint_core::checkpoint::{read_f64, read_u64};

        for per_op in &mut self.accum {
            for a in per_op {
                a.count = read_u64(r)?;
                a.ticks.dma0_wait = read_u64(r)?;
                a.ticks.dma0 = read_u64(r)?;
                a.ticks.mem = read_u64(r)?;
                a.ticks.dma1_wait = read_u64(r)?;
                a.ticks.dma1 = read_u64(r)?;
                a.total_ticks = read_u64(r)?;
                a.energy_dma0_pj = read_f64(r)?;
                a.energy_mem_pj = read_f64(r)?;
                a.energy_dma1_pj = read_f64(r)?;
                a.bytes = read_u64(r)?;
            }
        }

        for c in &mut self.conflicts {
            c.none = read_u64(r)?;
            c.dma0_channel = read_u64(r)?;
            c.dma0_mem = read_u64(r)?;
            c.dma1 = read_u64(r)?;
        }

        self.epoch_start = read_u64(r)?;
        for op in 0..3 {
            self.epoch_ops[op] = read_u64(r)?;
            self.epoch_bytes[op] = read_u64(r)?;
        }

        self.epochs.clear();
        let epochs = read_u64(r)?;
        for _ in 0..epochs {
            let mut epoch = EpochSnapshot {
                start: read_u64(r)?,
                end: read_u64(r)?,
                ..EpochSnapshot::default()
            };

            for op in 0..3 {
                epoch.ops[op] = read_u64(r)?;
                epoch.bytes[op] = read_u64(r)?;
            }

            self.epochs.push(epoch);
        }

        Ok(())
    }

    /// Flat `(name, value)` list for end-of-run reporting.
    pub fn report(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();

        for (op, name) in [
            (PalOp::Read, "read"),
            (PalOp::Write, "write"),
            (PalOp::Erase, "erase"),
        ] {
            let ticks = self.phase_ticks(op);
            let conflicts = self.conflicts(op);

            out.push((format!("pal.{name}.count"), self.count(op) as f64));
            out.push((format!("pal.{name}.bytes"), self.bytes(op) as f64));
            out.push((format!("pal.{name}.energy_pj"), self.energy_pj(op)));
            out.push((format!("pal.{name}.ticks.dma0_wait"), ticks.dma0_wait as f64));
            out.push((format!("pal.{name}.ticks.dma0"), ticks.dma0 as f64));
            out.push((format!("pal.{name}.ticks.mem"), ticks.mem as f64));
            out.push((format!("pal.{name}.ticks.dma1_wait"), ticks.dma1_wait as f64));
            out.push((format!("pal.{name}.ticks.dma1"), ticks.dma1 as f64));
            out.push((
                format!("pal.{name}.conflict.dma0_channel"),
                conflicts.dma0_channel as f64,
            ));
            out.push((
                format!("pal.{name}.conflict.dma0_mem"),
                conflicts.dma0_mem as f64,
            ));
            out.push((format!("pal.{name}.conflict.dma1"), conflicts.dma1 as f64));
            out.push((format!("pal.{name}.conflict.none"), conflicts.none as f64));
        }

        out.push(("pal.total.energy_pj".into(), self.total_energy_pj()));

        out
    }
}

impl Default for PalStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint_core::config::NandConfig;
    use flint_core::NandType;

    fn table() -> TimingTable {
        TimingTable::new(NandType::Slc, &NandConfig::default(), 4096)
    }

    #[test]
    fn accumulates_per_op_and_page_type() {
        let timing = table();
        let mut stats = PalStats::new();

        let times = PhaseTimes {
            dma0_wait: 5,
            dma0: 10,
            mem: 100,
            dma1_wait: 0,
            dma1: 20,
        };

        stats.add_command(
            &timing,
            PalOp::Read,
            PageType::Lsb,
            &times,
            Conflict::Dma0Channel,
            4096,
            0,
        );
        stats.add_command(
            &timing,
            PalOp::Read,
            PageType::Lsb,
            &times,
            Conflict::None,
            4096,
            0,
        );

        assert_eq!(stats.count(PalOp::Read), 2);
        assert_eq!(stats.count_by_page_type(PalOp::Read, PageType::Lsb), 2);
        assert_eq!(stats.bytes(PalOp::Read), 8192);
        assert_eq!(stats.phase_ticks(PalOp::Read).mem, 200);
        assert_eq!(stats.conflicts(PalOp::Read).dma0_channel, 1);
        assert_eq!(stats.conflicts(PalOp::Read).none, 1);
        assert!(stats.energy_pj(PalOp::Read) > 0.0);
    }

    #[test]
    fn epochs_roll_over() {
        let timing = table();
        let mut stats = PalStats::new();
        let times = PhaseTimes {
            mem: 100,
            ..Default::default()
        };

        stats.add_command(
            &timing,
            PalOp::Write,
            PageType::Lsb,
            &times,
            Conflict::None,
            4096,
            10,
        );
        stats.rollover(EPOCH_INTERVAL + 1);

        assert_eq!(stats.epochs().len(), 1);
        let epoch = stats.epochs()[0];
        assert_eq!(epoch.ops[PalOp::Write.index()], 1);
        assert_eq!(epoch.bytes[PalOp::Write.index()], 4096);
        assert!(epoch.iops() > 0.0);
    }
}
