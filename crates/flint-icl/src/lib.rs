//! Internal cache layer: a set-associative, write-back line cache in front
//! of the FTL. Lines are one logical page. When caching is disabled every
//! request passes straight through at DRAM-lookup cost only.

use flint_core::config::{EvictPolicy, IclConfig};
use flint_core::Tick;
use flint_ftl::PageMapping;
use flint_pal::Pal;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default)]
struct Line {
    tag: u64,
    valid: bool,
    dirty: bool,
    inserted: Tick,
    last_access: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Hit,
    Miss,
    /// The LPN has never been written; no line is allocated and no PAL
    /// traffic is issued.
    Unwritten,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

pub struct Cache {
    cfg: IclConfig,
    /// `sets * ways` lines, row per set.
    lines: Vec<Line>,
    /// Fixed DRAM lookup cost per cache access.
    lookup_latency: Tick,
    last_read_lpn: Option<u64>,
    stats: CacheStats,
}

impl Cache {
    pub fn new(cfg: IclConfig, line_size_bytes: u32) -> Self {
        // Row-cycle cost per burst times the bursts needed for one line.
        let per_access = cfg.dram_timing_rp + cfg.dram_timing_rcd + cfg.dram_timing_cl;
        let bursts = u64::from(line_size_bytes) / u64::from(cfg.dram_bus_width / 8).max(1);

        Self {
            lines: vec![Line::default(); (cfg.cache_sets * cfg.cache_ways) as usize],
            lookup_latency: per_access * bursts.max(1),
            cfg,
            last_read_lpn: None,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn lookup_latency(&self) -> Tick {
        self.lookup_latency
    }

    pub fn read(
        &mut self,
        lpn: u64,
        ftl: &mut PageMapping,
        pal: &mut Pal,
        tick: &mut Tick,
    ) -> ReadOutcome {
        if !self.cfg.read_cache {
            return if ftl.read(lpn, pal, tick) {
                ReadOutcome::Miss
            } else {
                ReadOutcome::Unwritten
            };
        }

        let prefetch = self.cfg.read_prefetch
            && self.last_read_lpn.is_some_and(|prev| prev + 1 == lpn);
        self.last_read_lpn = Some(lpn);

        if let Some(line) = self.probe(lpn) {
            line.last_access = *tick;
            *tick += self.lookup_latency;
            self.stats.read_hits += 1;

            trace!(lpn, "cache read hit");
            return ReadOutcome::Hit;
        }

        if ftl.mapping(lpn).is_none() {
            return ReadOutcome::Unwritten;
        }

        self.stats.read_misses += 1;

        // Evict first, then insert the clean line and fill it.
        let insert_at = *tick;
        self.evict_victim(lpn, ftl, pal, tick);

        let mut fill_tick = insert_at;
        ftl.read(lpn, pal, &mut fill_tick);

        self.insert(lpn, insert_at, false);
        *tick = (*tick).max(fill_tick) + self.lookup_latency;

        if prefetch && ftl.mapping(lpn + 1).is_some() && self.probe(lpn + 1).is_none() {
            let mut prefetch_tick = insert_at;

            self.evict_victim(lpn + 1, ftl, pal, &mut prefetch_tick);
            ftl.read(lpn + 1, pal, &mut prefetch_tick);
            self.insert(lpn + 1, insert_at, false);
        }

        ReadOutcome::Miss
    }

    /// Returns true on a hit (or a cold insert with caching on).
    pub fn write(
        &mut self,
        lpn: u64,
        ftl: &mut PageMapping,
        pal: &mut Pal,
        tick: &mut Tick,
    ) -> bool {
        if !self.cfg.write_cache {
            ftl.write(lpn, pal, tick);
            return false;
        }

        if let Some(line) = self.probe(lpn) {
            line.last_access = *tick;
            line.dirty = true;
            *tick += self.lookup_latency;
            self.stats.write_hits += 1;

            trace!(lpn, "cache write hit");
            return true;
        }

        self.stats.write_misses += 1;

        let insert_at = *tick;
        self.evict_victim(lpn, ftl, pal, tick);
        self.insert(lpn, insert_at, true);
        *tick += self.lookup_latency;

        false
    }

    /// Write back a dirty line and invalidate it. Returns true on a hit.
    pub fn flush(
        &mut self,
        lpn: u64,
        ftl: &mut PageMapping,
        pal: &mut Pal,
        tick: &mut Tick,
    ) -> bool {
        if !self.cfg.read_cache && !self.cfg.write_cache {
            return false;
        }

        let Some(line) = self.probe(lpn) else {
            return false;
        };

        let dirty = line.dirty;
        line.valid = false;

        if dirty {
            self.stats.writebacks += 1;
            ftl.write(lpn, pal, tick);
        }

        true
    }

    /// Write back every dirty line (namespace-wide flush).
    pub fn flush_all(&mut self, ftl: &mut PageMapping, pal: &mut Pal, tick: &mut Tick) {
        let mut finished = *tick;

        for idx in 0..self.lines.len() {
            let line = self.lines[idx];

            if !line.valid {
                continue;
            }

            self.lines[idx].valid = false;

            if line.dirty {
                self.stats.writebacks += 1;

                let mut line_tick = *tick;
                ftl.write(line.tag, pal, &mut line_tick);
                finished = finished.max(line_tick);
            }
        }

        *tick = finished;
    }

    /// Drop the line and pass the trim through to the FTL.
    pub fn trim(&mut self, lpn: u64, ftl: &mut PageMapping, tick: &mut Tick) -> bool {
        let hit = if self.cfg.read_cache || self.cfg.write_cache {
            match self.probe(lpn) {
                Some(line) => {
                    line.valid = false;
                    true
                }
                None => false,
            }
        } else {
            false
        };

        ftl.trim(lpn, tick);
        hit
    }

    fn set_of(&self, lpn: u64) -> usize {
        (lpn % u64::from(self.cfg.cache_sets)) as usize
    }

    fn probe(&mut self, lpn: u64) -> Option<&mut Line> {
        let ways = self.cfg.cache_ways as usize;
        let base = self.set_of(lpn) * ways;

        self.lines[base..base + ways]
            .iter_mut()
            .find(|line| line.valid && line.tag == lpn)
    }

    /// Free up a way in `lpn`'s set, writing back a dirty victim.
    fn evict_victim(
        &mut self,
        lpn: u64,
        ftl: &mut PageMapping,
        pal: &mut Pal,
        tick: &mut Tick,
    ) {
        let ways = self.cfg.cache_ways as usize;
        let base = self.set_of(lpn) * ways;
        let set = &self.lines[base..base + ways];

        if set.iter().any(|line| !line.valid) {
            return;
        }

        let victim = base
            + match self.cfg.evict_policy {
                EvictPolicy::FirstEntry => 0,
                EvictPolicy::Fifo => set
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, line)| line.inserted)
                    .map(|(idx, _)| idx)
                    .unwrap(),
                EvictPolicy::Lru => set
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, line)| line.last_access)
                    .map(|(idx, _)| idx)
                    .unwrap(),
            };

        let line = self.lines[victim];

        self.stats.evictions += 1;
        self.lines[victim].valid = false;

        if line.dirty {
            self.stats.writebacks += 1;
            trace!(lpn = line.tag, "dirty eviction");
            ftl.write(line.tag, pal, tick);
        }
    }

    fn insert(&mut self, lpn: u64, tick: Tick, dirty: bool) {
        let ways = self.cfg.cache_ways as usize;
        let base = self.set_of(lpn) * ways;
        let slot = self.lines[base..base + ways]
            .iter()
            .position(|line| !line.valid)
            .expect("insert without a free way");

        self.lines[base + slot] = Line {
            tag: lpn,
            valid: true,
            dirty,
            inserted: tick,
            last_access: tick,
        };
    }

    /// Serialize every line plus access bookkeeping. Only valid against an
    /// identical cache configuration.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_bool, write_u64};

        write_u64(w, self.lines.len() as u64)?;

        for line in &self.lines {
            write_u64(w, line.tag)?;
            write_bool(w, line.valid)?;
            write_bool(w, line.dirty)?;
            write_u64(w, line.inserted)?;
            write_u64(w, line.last_access)?;
        }

        write_bool(w, self.last_read_lpn.is_some())?;
        write_u64(w, self.last_read_lpn.unwrap_or(0))?;

        for v in [
            self.stats.read_hits,
            self.stats.read_misses,
            self.stats.write_hits,
            self.stats.write_misses,
            self.stats.evictions,
            self.stats.writebacks,
        ] {
            write_u64(w, v)?;
        }

        Ok(())
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> std::io::Result<()> {
        use flint_core::checkpoint::{invalid_data, read_bool, read_u64};

        if read_u64(r)? != self.lines.len() as u64 {
            return Err(invalid_data("checkpoint cache geometry mismatch"));
        }

        for line in &mut self.lines {
            line.tag = read_u64(r)?;
            line.valid = read_bool(r)?;
            line.dirty = read_bool(r)?;
            line.inserted = read_u64(r)?;
            line.last_access = read_u64(r)?;
        }

        let has_last = read_bool(r)?;
        let last = read_u64(r)?;
        self.last_read_lpn = has_last.then_some(last);

        self.stats.read_hits = read_u64(r)?;
        self.stats.read_misses = read_u64(r)?;
        self.stats.write_hits = read_u64(r)?;
        self.stats.write_misses = read_u64(r)?;
        self.stats.evictions = read_u64(r)?;
        self.stats.writebacks = read_u64(r)?;

        Ok(())
    }
}
