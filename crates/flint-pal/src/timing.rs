//! NAND timing and power tables.
//!
//! One concrete table per device, keyed by NAND type at construction. Array
//! (MEM) latency depends on the page type of the addressed wordline;
//! command/address (DMA0) and data (DMA1) bus phases are derived from the
//! raw interface timings and the page size.

use flint_core::config::NandConfig;
use flint_core::{NandType, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PalOp {
    Read,
    Write,
    Erase,
}

impl PalOp {
    pub const ALL: [PalOp; 3] = [PalOp::Read, PalOp::Write, PalOp::Erase];

    pub fn index(self) -> usize {
        match self {
            PalOp::Read => 0,
            PalOp::Write => 1,
            PalOp::Erase => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PalPhase {
    Dma0,
    Mem,
    Dma1,
}

/// Which bit of the wordline a page occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Lsb,
    Csb,
    Msb,
}

impl PageType {
    pub fn index(self) -> usize {
        match self {
            PageType::Lsb => 0,
            PageType::Csb => 1,
            PageType::Msb => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseSet {
    dma0: Tick,
    /// Per page type; unused entries mirror the LSB value.
    mem: [Tick; 3],
    dma1: Tick,
}

#[derive(Debug, Clone)]
pub struct TimingTable {
    nand_type: NandType,
    read: PhaseSet,
    write: PhaseSet,
    erase: PhaseSet,
    power_bus_nw: u64,
    power_read_nw: u64,
    power_write_nw: u64,
    power_erase_nw: u64,
    power_standby_nw: u64,
}

impl TimingTable {
    pub fn new(nand_type: NandType, cfg: &NandConfig, page_size_bytes: u32) -> Self {
        let page_size = Tick::from(page_size_bytes);
        let cmdlatch = cfg.t_cs + cfg.t_dh;
        let address = cmdlatch + 5 * (cfg.t_ds + cfg.t_dh);

        let read_dma0 = cmdlatch + address + cmdlatch;
        let read_dma1 = cfg.t_wp + cfg.t_wc * page_size + cfg.t_dh;
        let write_dma0 = cmdlatch + address + cfg.t_adl + cfg.t_rc * page_size + cmdlatch;
        let write_dma1 = cfg.t_wp + cfg.t_dh;
        let erase_dma0 = cmdlatch + address;
        let erase_dma1 = write_dma1;

        let spread = |base: [u64; 3]| match nand_type {
            NandType::Slc => [base[0]; 3],
            NandType::Mlc => [base[0], base[1], base[1]],
            NandType::Tlc => base,
        };

        Self {
            nand_type,
            read: PhaseSet {
                dma0: read_dma0,
                mem: spread(cfg.t_r).map(|t| cfg.t_ds + cfg.t_wb + t + cfg.t_rr),
                dma1: read_dma1,
            },
            write: PhaseSet {
                dma0: write_dma0,
                mem: spread(cfg.t_prog).map(|t| t + cfg.t_wp + cfg.t_dh),
                dma1: write_dma1,
            },
            erase: PhaseSet {
                dma0: erase_dma0,
                mem: [cfg.t_bers; 3],
                dma1: erase_dma1,
            },
            power_bus_nw: cfg.vcc * cfg.icc5,
            power_read_nw: cfg.vcc * cfg.icc1,
            power_write_nw: cfg.vcc * cfg.icc2,
            power_erase_nw: cfg.vcc * cfg.icc3,
            power_standby_nw: cfg.vcc * cfg.isb,
        }
    }

    /// Table with explicit per-phase durations, for tests and calibration
    /// runs that bypass the raw interface timings.
    pub fn from_phases(
        nand_type: NandType,
        read: (Tick, Tick, Tick),
        write: (Tick, Tick, Tick),
        erase: (Tick, Tick),
    ) -> Self {
        Self {
            nand_type,
            read: PhaseSet {
                dma0: read.0,
                mem: [read.1; 3],
                dma1: read.2,
            },
            write: PhaseSet {
                dma0: write.0,
                mem: [write.1; 3],
                dma1: write.2,
            },
            erase: PhaseSet {
                dma0: erase.0,
                mem: [erase.1; 3],
                dma1: 0,
            },
            power_bus_nw: 0,
            power_read_nw: 0,
            power_write_nw: 0,
            power_erase_nw: 0,
            power_standby_nw: 0,
        }
    }

    /// Page type of `page_index` under this device's cell mapping.
    pub fn page_type(&self, page_index: u32) -> PageType {
        match self.nand_type {
            NandType::Slc => PageType::Lsb,
            NandType::Mlc => {
                if (page_index / 2) % 2 == 0 {
                    PageType::Lsb
                } else {
                    PageType::Msb
                }
            }
            NandType::Tlc => {
                if page_index <= 5 {
                    PageType::Lsb
                } else if page_index <= 7 {
                    PageType::Csb
                } else {
                    match ((page_index - 8) / 2) % 3 {
                        0 => PageType::Lsb,
                        1 => PageType::Csb,
                        _ => PageType::Msb,
                    }
                }
            }
        }
    }

    /// Phase duration in picoseconds for the given page and operation.
    pub fn latency(&self, page_index: u32, op: PalOp, phase: PalPhase) -> Tick {
        let set = match op {
            PalOp::Read => &self.read,
            PalOp::Write => &self.write,
            PalOp::Erase => &self.erase,
        };

        match phase {
            PalPhase::Dma0 => set.dma0,
            PalPhase::Mem => set.mem[self.page_type(page_index).index()],
            PalPhase::Dma1 => set.dma1,
        }
    }

    /// Draw in nW while `op` holds a resource in `phase`.
    pub fn power(&self, op: PalOp, phase: PalPhase) -> u64 {
        match phase {
            PalPhase::Dma0 | PalPhase::Dma1 => self.power_bus_nw,
            PalPhase::Mem => match op {
                PalOp::Read => self.power_read_nw,
                PalOp::Write => self.power_write_nw,
                PalOp::Erase => self.power_erase_nw,
            },
        }
    }

    pub fn standby_power(&self) -> u64 {
        self.power_standby_nw
    }

    pub fn nand_type(&self) -> NandType {
        self.nand_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(nand: NandType) -> TimingTable {
        TimingTable::new(nand, &NandConfig::default(), 4096)
    }

    #[test]
    fn slc_has_one_page_type() {
        let t = table(NandType::Slc);

        for page in 0..64 {
            assert_eq!(t.page_type(page), PageType::Lsb);
        }
    }

    #[test]
    fn mlc_alternates_in_pairs() {
        let t = table(NandType::Mlc);

        assert_eq!(t.page_type(0), PageType::Lsb);
        assert_eq!(t.page_type(1), PageType::Lsb);
        assert_eq!(t.page_type(2), PageType::Msb);
        assert_eq!(t.page_type(3), PageType::Msb);
        assert_eq!(t.page_type(4), PageType::Lsb);
    }

    #[test]
    fn tlc_cycles_after_lower_pages() {
        let t = table(NandType::Tlc);

        assert_eq!(t.page_type(0), PageType::Lsb);
        assert_eq!(t.page_type(5), PageType::Lsb);
        assert_eq!(t.page_type(6), PageType::Csb);
        assert_eq!(t.page_type(7), PageType::Csb);
        assert_eq!(t.page_type(8), PageType::Lsb);
        assert_eq!(t.page_type(10), PageType::Csb);
        assert_eq!(t.page_type(12), PageType::Msb);
        assert_eq!(t.page_type(14), PageType::Lsb);
    }

    #[test]
    fn mem_latency_grows_with_page_type() {
        let t = table(NandType::Tlc);

        let lsb = t.latency(0, PalOp::Read, PalPhase::Mem);
        let csb = t.latency(6, PalOp::Read, PalPhase::Mem);
        let msb = t.latency(12, PalOp::Read, PalPhase::Mem);

        assert!(lsb < csb && csb < msb);
    }

    #[test]
    fn dma_phases_scale_with_page_size() {
        let cfg = NandConfig::default();
        let small = TimingTable::new(NandType::Slc, &cfg, 4096);
        let large = TimingTable::new(NandType::Slc, &cfg, 16384);

        assert!(
            small.latency(0, PalOp::Read, PalPhase::Dma1)
                < large.latency(0, PalOp::Read, PalPhase::Dma1)
        );
        assert_eq!(
            small.latency(0, PalOp::Erase, PalPhase::Dma0),
            large.latency(0, PalOp::Erase, PalPhase::Dma0)
        );
    }

    #[test]
    fn phase_table_is_explicit() {
        let t = TimingTable::from_phases(
            NandType::Slc,
            (1_000_000, 58_000_000, 2_000_000),
            (1_000_000, 500_000_000, 1_000_000),
            (1_000_000, 2_000_000_000),
        );

        assert_eq!(t.latency(0, PalOp::Write, PalPhase::Mem), 500_000_000);
        assert_eq!(t.latency(0, PalOp::Erase, PalPhase::Dma1), 0);
    }
}
