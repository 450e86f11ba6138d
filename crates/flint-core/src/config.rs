//! INI configuration loader.
//!
//! Sections `[ssd]`, `[cpu]`, `[ftl]`, `[icl]`, `[nvme]` and `[pal]` are
//! recognized; unknown keys are ignored so configs can carry annotations
//! for other tools. Everything is validated here, once, and immutable
//! afterwards.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::cpu::CpuConfig;
use crate::geometry::{AddrAxis, Geometry, NandType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed line {line}: {text:?}")]
    Parse { line: usize, text: String },

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("{key} out of range: {reason}")]
    OutOfRange {
        key: &'static str,
        reason: &'static str,
    },

    #[error("AddrRemap_* keys do not form a permutation of the six address axes")]
    BadAllocationOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Reclaim a fixed number of blocks per pass.
    Static,
    /// Reclaim up to `total_blocks * reclaim_threshold - free_blocks`.
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimPolicy {
    Greedy,
    CostBenefit,
}

#[derive(Debug, Clone, Copy)]
pub struct FtlConfig {
    /// Overprovisioning ratio: fraction of physical capacity hidden from
    /// the logical address space.
    pub op_ratio: f64,
    /// Free-block ratio below which writes trigger garbage collection.
    pub gc_threshold: f64,
    /// Erase count at which a block is retired as bad.
    pub erase_cycle: u32,
    /// Fraction of logical pages pre-filled at startup.
    pub warmup: f64,
    pub gc_mode: GcMode,
    pub reclaim_blocks: u32,
    pub reclaim_threshold: f64,
    pub victim_policy: VictimPolicy,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            op_ratio: 0.25,
            gc_threshold: 0.05,
            erase_cycle: 100_000,
            warmup: 0.0,
            gc_mode: GcMode::Static,
            reclaim_blocks: 1,
            reclaim_threshold: 0.1,
            victim_policy: VictimPolicy::Greedy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictPolicy {
    FirstEntry,
    Fifo,
    Lru,
}

#[derive(Debug, Clone, Copy)]
pub struct IclConfig {
    pub read_cache: bool,
    pub write_cache: bool,
    pub read_prefetch: bool,
    /// Number of sets.
    pub cache_sets: u32,
    /// Ways per set.
    pub cache_ways: u32,
    pub evict_policy: EvictPolicy,
    /// DRAM chip bus width in bits.
    pub dram_bus_width: u32,
    /// DRAM tRP + tRCD + tCL, each in picoseconds.
    pub dram_timing_rp: u64,
    pub dram_timing_rcd: u64,
    pub dram_timing_cl: u64,
}

impl Default for IclConfig {
    fn default() -> Self {
        Self {
            read_cache: true,
            write_cache: true,
            read_prefetch: false,
            cache_sets: 8192,
            cache_ways: 1,
            evict_policy: EvictPolicy::Lru,
            dram_bus_width: 64,
            dram_timing_rp: 13_750,
            dram_timing_rcd: 13_750,
            dram_timing_cl: 13_750,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NvmeConfig {
    pub max_sq: u16,
    pub max_cq: u16,
    /// 1-based weighted-round-robin weights.
    pub wrr_high: u16,
    pub wrr_medium: u16,
    /// Arbiter fetch period in picoseconds.
    pub work_interval: u64,
    /// Internal dispatch buffer depth.
    pub request_queue_size: u32,
    /// Host block size in bytes.
    pub lba_size: u32,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            max_sq: 16,
            max_cq: 16,
            wrr_high: 2,
            wrr_medium: 2,
            work_interval: 50_000_000,
            request_queue_size: 1024,
            lba_size: 512,
        }
    }
}

/// Raw NAND interface timing (all picoseconds) and supply power. The PAL
/// derives per-phase DMA durations and per-page-type array latencies from
/// these, the same way the reference timing tables do.
#[derive(Debug, Clone, Copy)]
pub struct NandConfig {
    pub t_cs: u64,
    pub t_ds: u64,
    pub t_dh: u64,
    pub t_wp: u64,
    pub t_rc: u64,
    pub t_wc: u64,
    pub t_adl: u64,
    pub t_wb: u64,
    pub t_rr: u64,
    /// Array read time per page type (LSB/CSB/MSB).
    pub t_r: [u64; 3],
    /// Array program time per page type.
    pub t_prog: [u64; 3],
    /// Block erase time.
    pub t_bers: u64,
    /// Supply voltage in mV.
    pub vcc: u64,
    /// Currents in uA: read, program, erase, bus, standby.
    pub icc1: u64,
    pub icc2: u64,
    pub icc3: u64,
    pub icc5: u64,
    pub isb: u64,
}

impl Default for NandConfig {
    fn default() -> Self {
        Self {
            t_cs: 20_000,
            t_ds: 10_000,
            t_dh: 10_000,
            t_wp: 25_000,
            t_rc: 25,
            t_wc: 25,
            t_adl: 300_000,
            t_wb: 100_000,
            t_rr: 20_000,
            // 58/78/107 us reads, 0.8/2.2 ms programs, 3.5 ms erase.
            t_r: [58_000_000, 78_000_000, 107_000_000],
            t_prog: [800_000_000, 2_200_000_000, 2_200_000_000],
            t_bers: 3_500_000_000,
            vcc: 3_300,
            icc1: 25_000,
            icc2: 25_000,
            icc3: 25_000,
            icc5: 5_000,
            isb: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub geometry: Geometry,
    pub cpu: CpuConfig,
    pub ftl: FtlConfig,
    pub icl: IclConfig,
    pub nvme: NvmeConfig,
    pub nand: NandConfig,
}

impl SimConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;

        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let raw = parse_ini(text)?;

        let mut cfg = Self::default();
        cfg.apply(&raw)?;
        cfg.geometry.validate()?;
        cfg.check_ranges()?;

        Ok(cfg)
    }

    fn apply(&mut self, raw: &IniMap) -> Result<(), ConfigError> {
        let g = &mut self.geometry;

        if let Some(v) = raw.get_u32("ssd", "NANDType")? {
            g.nand_type = match v {
                0 => NandType::Slc,
                1 => NandType::Mlc,
                2 => NandType::Tlc,
                _ => {
                    return Err(ConfigError::OutOfRange {
                        key: "NANDType",
                        reason: "must be 0 (SLC), 1 (MLC) or 2 (TLC)",
                    })
                }
            };
        }

        raw.read_u32("ssd", "NumChannel", &mut g.channels)?;
        raw.read_u32("ssd", "NumPackage", &mut g.ways_per_channel)?;
        raw.read_u32("ssd", "NumDie", &mut g.dies_per_way)?;
        raw.read_u32("ssd", "NumPlane", &mut g.planes_per_die)?;
        raw.read_u32("ssd", "NumBlock", &mut g.blocks_per_plane)?;
        raw.read_u32("ssd", "NumPage", &mut g.pages_per_block)?;
        raw.read_u32("ssd", "SizePage", &mut g.page_size_bytes)?;
        raw.read_u32("ssd", "DMAMhz", &mut g.dma_speed_mtps)?;
        raw.read_u32("ssd", "DMAWidth", &mut g.dma_width_bits)?;
        raw.read_bool("ssd", "UseMultiPlane", &mut g.use_multi_plane)?;

        raw.read_u64("cpu", "Clock", &mut self.cpu.clock_hz)?;
        raw.read_u32("cpu", "HILCore", &mut self.cpu.hil_cores)?;
        raw.read_u32("cpu", "ICLCore", &mut self.cpu.icl_cores)?;
        raw.read_u32("cpu", "FTLCore", &mut self.cpu.ftl_cores)?;

        raw.read_f64("ftl", "FTLOP", &mut self.ftl.op_ratio)?;
        raw.read_f64("ftl", "FTLGCThreshold", &mut self.ftl.gc_threshold)?;
        raw.read_u32("ftl", "FTLEraseCycle", &mut self.ftl.erase_cycle)?;
        raw.read_u32("ftl", "SuperblockDegree", &mut g.superblock_degree)?;
        raw.read_f64("ftl", "Warmup", &mut self.ftl.warmup)?;

        if let Some(v) = raw.get_u32("ftl", "GCMode")? {
            self.ftl.gc_mode = match v {
                0 => GcMode::Static,
                1 => GcMode::Threshold,
                _ => {
                    return Err(ConfigError::OutOfRange {
                        key: "GCMode",
                        reason: "must be 0 (static) or 1 (threshold)",
                    })
                }
            };
        }
        raw.read_u32("ftl", "GCReclaimBlock", &mut self.ftl.reclaim_blocks)?;
        raw.read_f64("ftl", "GCReclaimThreshold", &mut self.ftl.reclaim_threshold)?;
        if let Some(v) = raw.get_u32("ftl", "GCEvictPolicy")? {
            self.ftl.victim_policy = match v {
                0 => VictimPolicy::Greedy,
                1 => VictimPolicy::CostBenefit,
                _ => {
                    return Err(ConfigError::OutOfRange {
                        key: "GCEvictPolicy",
                        reason: "must be 0 (greedy) or 1 (cost-benefit)",
                    })
                }
            };
        }

        if let Some(order) = parse_addr_remap(raw)? {
            g.page_allocation_order = order;
        }

        raw.read_bool("icl", "EnableReadCache", &mut self.icl.read_cache)?;
        raw.read_bool("icl", "EnableWriteCache", &mut self.icl.write_cache)?;
        raw.read_bool("icl", "EnableReadPrefetch", &mut self.icl.read_prefetch)?;
        raw.read_u32("icl", "CacheSize", &mut self.icl.cache_sets)?;
        raw.read_u32("icl", "EntrySize", &mut self.icl.cache_ways)?;
        if let Some(v) = raw.get_u32("icl", "EvictPolicy")? {
            self.icl.evict_policy = match v {
                0 => EvictPolicy::FirstEntry,
                1 => EvictPolicy::Fifo,
                2 => EvictPolicy::Lru,
                _ => {
                    return Err(ConfigError::OutOfRange {
                        key: "EvictPolicy",
                        reason: "must be 0 (first), 1 (FIFO) or 2 (LRU)",
                    })
                }
            };
        }
        raw.read_u32("icl", "DRAMBusWidth", &mut self.icl.dram_bus_width)?;
        raw.read_u64("icl", "DRAMTimingRP", &mut self.icl.dram_timing_rp)?;
        raw.read_u64("icl", "DRAMTimingRCD", &mut self.icl.dram_timing_rcd)?;
        raw.read_u64("icl", "DRAMTimingCL", &mut self.icl.dram_timing_cl)?;

        raw.read_u16("nvme", "MaxSQ", &mut self.nvme.max_sq)?;
        raw.read_u16("nvme", "MaxCQ", &mut self.nvme.max_cq)?;
        raw.read_u16("nvme", "WRR.High", &mut self.nvme.wrr_high)?;
        raw.read_u16("nvme", "WRR.Medium", &mut self.nvme.wrr_medium)?;
        raw.read_u64("nvme", "WorkInterval", &mut self.nvme.work_interval)?;
        raw.read_u32("nvme", "RequestQueueSize", &mut self.nvme.request_queue_size)?;
        raw.read_u32("nvme", "LBASize", &mut self.nvme.lba_size)?;

        let n = &mut self.nand;
        raw.read_u64("pal", "tCS", &mut n.t_cs)?;
        raw.read_u64("pal", "tDS", &mut n.t_ds)?;
        raw.read_u64("pal", "tDH", &mut n.t_dh)?;
        raw.read_u64("pal", "tWP", &mut n.t_wp)?;
        raw.read_u64("pal", "tRC", &mut n.t_rc)?;
        raw.read_u64("pal", "tWC", &mut n.t_wc)?;
        raw.read_u64("pal", "tADL", &mut n.t_adl)?;
        raw.read_u64("pal", "tWB", &mut n.t_wb)?;
        raw.read_u64("pal", "tRR", &mut n.t_rr)?;
        raw.read_u64("pal", "tR0", &mut n.t_r[0])?;
        raw.read_u64("pal", "tR1", &mut n.t_r[1])?;
        raw.read_u64("pal", "tR2", &mut n.t_r[2])?;
        raw.read_u64("pal", "tPROG0", &mut n.t_prog[0])?;
        raw.read_u64("pal", "tPROG1", &mut n.t_prog[1])?;
        raw.read_u64("pal", "tPROG2", &mut n.t_prog[2])?;
        raw.read_u64("pal", "tBERS", &mut n.t_bers)?;
        raw.read_u64("pal", "VCC", &mut n.vcc)?;
        raw.read_u64("pal", "ICC1", &mut n.icc1)?;
        raw.read_u64("pal", "ICC2", &mut n.icc2)?;
        raw.read_u64("pal", "ICC3", &mut n.icc3)?;
        raw.read_u64("pal", "ICC5", &mut n.icc5)?;
        raw.read_u64("pal", "ISB", &mut n.isb)?;

        Ok(())
    }

    fn check_ranges(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.ftl.op_ratio) {
            return Err(ConfigError::OutOfRange {
                key: "FTLOP",
                reason: "must be in [0, 1)",
            });
        }

        if !(0.0..1.0).contains(&self.ftl.gc_threshold) {
            return Err(ConfigError::OutOfRange {
                key: "FTLGCThreshold",
                reason: "must be in [0, 1)",
            });
        }

        if !(0.0..=1.0).contains(&self.ftl.warmup) {
            return Err(ConfigError::OutOfRange {
                key: "Warmup",
                reason: "must be in [0, 1]",
            });
        }

        if self.nvme.wrr_high == 0 || self.nvme.wrr_medium == 0 {
            return Err(ConfigError::OutOfRange {
                key: "WRR.High/WRR.Medium",
                reason: "weights are 1-based and must be >= 1",
            });
        }

        if !self.nvme.lba_size.is_power_of_two() {
            return Err(ConfigError::OutOfRange {
                key: "LBASize",
                reason: "must be a power of two",
            });
        }

        if self.nvme.max_sq == 0 || self.nvme.max_cq == 0 {
            return Err(ConfigError::OutOfRange {
                key: "MaxSQ/MaxCQ",
                reason: "must be >= 1",
            });
        }

        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry {
                channels: 8,
                ways_per_channel: 4,
                dies_per_way: 2,
                planes_per_die: 1,
                blocks_per_plane: 512,
                pages_per_block: 512,
                page_size_bytes: 16384,
                nand_type: NandType::Tlc,
                dma_speed_mtps: 800,
                dma_width_bits: 8,
                superblock_degree: 1,
                page_allocation_order: [
                    AddrAxis::Channel,
                    AddrAxis::Way,
                    AddrAxis::Die,
                    AddrAxis::Plane,
                ],
                use_multi_plane: false,
            },
            cpu: CpuConfig::default(),
            ftl: FtlConfig::default(),
            icl: IclConfig::default(),
            nvme: NvmeConfig::default(),
            nand: NandConfig::default(),
        }
    }
}

/// `AddrRemap_*` keys give the position (0 = fastest varying) of each axis
/// in the PPN encoding. Block and page must stay above the four array axes;
/// positions 0..=3 order the array axes.
fn parse_addr_remap(raw: &IniMap) -> Result<Option<[AddrAxis; 4]>, ConfigError> {
    const KEYS: [(&str, Option<AddrAxis>); 6] = [
        ("AddrRemap_CHANNEL", Some(AddrAxis::Channel)),
        ("AddrRemap_PACKAGE", Some(AddrAxis::Way)),
        ("AddrRemap_DIE", Some(AddrAxis::Die)),
        ("AddrRemap_PLANE", Some(AddrAxis::Plane)),
        ("AddrRemap_BLOCK", None),
        ("AddrRemap_PAGE", None),
    ];

    let mut any = false;
    let mut slots: [Option<Option<AddrAxis>>; 6] = [None; 6];

    for (key, axis) in KEYS {
        let Some(pos) = raw.get_u32("ftl", key)? else {
            continue;
        };

        any = true;

        // The reference parser silently indexed out of bounds here; we
        // reject instead.
        let pos = pos as usize;
        if pos > 5 || slots[pos].is_some() {
            return Err(ConfigError::BadAllocationOrder);
        }

        slots[pos] = Some(axis);
    }

    if !any {
        return Ok(None);
    }

    if slots.iter().any(|s| s.is_none()) {
        return Err(ConfigError::BadAllocationOrder);
    }

    // Block below page, both above the array axes.
    if slots[4] != Some(None) || slots[5] != Some(None) {
        return Err(ConfigError::BadAllocationOrder);
    }

    let mut order = [AddrAxis::Channel; 4];

    for (pos, slot) in slots[..4].iter().enumerate() {
        match slot {
            Some(Some(axis)) => order[pos] = *axis,
            _ => return Err(ConfigError::BadAllocationOrder),
        }
    }

    Ok(Some(order))
}

struct IniMap {
    values: HashMap<(String, String), String>,
}

impl IniMap {
    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.values
            .get(&(section.to_ascii_lowercase(), key.to_ascii_lowercase()))
            .map(String::as_str)
    }

    fn get_u32(&self, section: &str, key: &str) -> Result<Option<u32>, ConfigError> {
        self.get(section, key)
            .map(|v| {
                v.parse().map_err(|_| ConfigError::Invalid {
                    key: key.into(),
                    value: v.into(),
                })
            })
            .transpose()
    }

    fn read_u32(&self, section: &str, key: &str, out: &mut u32) -> Result<(), ConfigError> {
        if let Some(v) = self.get_u32(section, key)? {
            *out = v;
        }

        Ok(())
    }

    fn read_u16(&self, section: &str, key: &str, out: &mut u16) -> Result<(), ConfigError> {
        if let Some(v) = self.get(section, key) {
            *out = v.parse().map_err(|_| ConfigError::Invalid {
                key: key.into(),
                value: v.into(),
            })?;
        }

        Ok(())
    }

    fn read_u64(&self, section: &str, key: &str, out: &mut u64) -> Result<(), ConfigError> {
        if let Some(v) = self.get(section, key) {
            *out = v.parse().map_err(|_| ConfigError::Invalid {
                key: key.into(),
                value: v.into(),
            })?;
        }

        Ok(())
    }

    fn read_f64(&self, section: &str, key: &str, out: &mut f64) -> Result<(), ConfigError> {
        if let Some(v) = self.get(section, key) {
            *out = v.parse().map_err(|_| ConfigError::Invalid {
                key: key.into(),
                value: v.into(),
            })?;
        }

        Ok(())
    }

    fn read_bool(&self, section: &str, key: &str, out: &mut bool) -> Result<(), ConfigError> {
        if let Some(v) = self.get(section, key) {
            *out = match v {
                "1" | "true" | "True" | "yes" => true,
                "0" | "false" | "False" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: key.into(),
                        value: v.into(),
                    })
                }
            };
        }

        Ok(())
    }
}

fn parse_ini(text: &str) -> Result<IniMap, ConfigError> {
    let mut values = HashMap::new();
    let mut section = String::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = match raw_line.find([';', '#']) {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        }
        .trim();

        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[') {
            let Some(name) = name.strip_suffix(']') else {
                return Err(ConfigError::Parse {
                    line: idx + 1,
                    text: raw_line.into(),
                });
            };

            section = name.trim().to_ascii_lowercase();
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Parse {
                line: idx + 1,
                text: raw_line.into(),
            });
        };

        values.insert(
            (section.clone(), key.trim().to_ascii_lowercase()),
            value.trim().to_string(),
        );
    }

    Ok(IniMap { values })
}
