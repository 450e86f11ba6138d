//! Page-mapping flash translation layer.
//!
//! Sparse LPN -> (superblock, page) table, a free pool ordered by wear,
//! and garbage collection that copies surviving pages before erasing its
//! victims. All latency flows through the PAL via `&mut tick`; the
//! mapping itself costs nothing extra here (the firmware CPU model
//! accounts for it at the HIL boundary).

use std::collections::{BTreeMap, HashMap};

use flint_core::config::{FtlConfig, GcMode, VictimPolicy};
use flint_core::{Geometry, Tick};
use flint_pal::{Pal, PalRequest};
use tracing::{debug, trace};

use crate::block::Block;

/// Half-open LPN range for format.
#[derive(Debug, Clone, Copy)]
pub struct LpnRange {
    pub slpn: u64,
    pub nlp: u64,
}

pub struct PageMapping {
    geometry: Geometry,
    cfg: FtlConfig,
    /// LPN -> (superblock id, page in block).
    table: HashMap<u64, (u64, u32)>,
    /// Blocks currently holding data (or being filled).
    blocks: HashMap<u64, Block>,
    /// Wear-ordered free pool: least erased first, block id breaks ties.
    free_blocks: BTreeMap<(u32, u64), Block>,
    last_free_block: u64,
    reclaim_more: bool,
    total_blocks: u64,
    logical_pages: u64,
}

impl PageMapping {
    pub fn new(geometry: Geometry, cfg: FtlConfig) -> Self {
        let total_blocks = geometry.total_superblocks();
        let logical_blocks =
            (total_blocks as f64 * (1.0 - cfg.op_ratio)).floor() as u64;
        let logical_pages = logical_blocks * u64::from(geometry.pages_per_block);

        let mut free_blocks = BTreeMap::new();

        for id in 0..total_blocks {
            free_blocks.insert((0, id), Block::new(geometry.pages_per_block));
        }

        let mut this = Self {
            geometry,
            cfg,
            table: HashMap::new(),
            blocks: HashMap::new(),
            free_blocks,
            last_free_block: 0,
            reclaim_more: false,
            total_blocks,
            logical_pages,
        };

        this.last_free_block = this.take_free_block();
        this
    }

    /// Pre-fill the configured fraction of the logical space with
    /// mapping-only writes (no PAL traffic).
    pub fn warmup(&mut self) {
        let n = (self.logical_pages as f64 * self.cfg.warmup) as u64;
        let mut tick = 0;

        debug!(pages = n, "ftl warmup");

        for lpn in 0..n {
            self.write_internal(lpn, None, &mut tick);
        }
    }

    pub fn logical_pages(&self) -> u64 {
        self.logical_pages
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn free_block_count(&self) -> u64 {
        self.free_blocks.len() as u64
    }

    pub fn free_block_ratio(&self) -> f64 {
        self.free_blocks.len() as f64 / self.total_blocks as f64
    }

    pub fn mapping(&self, lpn: u64) -> Option<(u64, u32)> {
        self.table.get(&lpn).copied()
    }

    pub fn block(&self, id: u64) -> Option<&Block> {
        self.blocks.get(&id).or_else(|| {
            self.free_blocks
                .iter()
                .find(|((_, bid), _)| *bid == id)
                .map(|(_, b)| b)
        })
    }

    /// Read `lpn`. Unwritten LPNs return `false` with the tick unchanged.
    pub fn read(&mut self, lpn: u64, pal: &mut Pal, tick: &mut Tick) -> bool {
        let Some(&(block_id, page)) = self.table.get(&lpn) else {
            trace!(lpn, "read of unwritten lpn");
            return false;
        };

        let block = self
            .blocks
            .get_mut(&block_id)
            .expect("mapped block is not in use");

        block.read(page, *tick);
        pal.read(
            &PalRequest::full(block_id, page, self.geometry.superblock_degree),
            tick,
        );

        true
    }

    pub fn write(&mut self, lpn: u64, pal: &mut Pal, tick: &mut Tick) {
        self.write_internal(lpn, Some(pal), tick);
    }

    fn write_internal(&mut self, lpn: u64, pal: Option<&mut Pal>, tick: &mut Tick) {
        if let Some(&(old_block, old_page)) = self.table.get(&lpn) {
            self.blocks
                .get_mut(&old_block)
                .expect("mapped block is not in use")
                .invalidate(old_page);
        }

        let block_id = self.last_free_block_id();
        let block = self.blocks.get_mut(&block_id).expect("free block missing");
        let page = block.next_write_page();

        block.write(page, lpn, *tick);
        self.table.insert(lpn, (block_id, page));

        if let Some(pal) = pal {
            pal.write(
                &PalRequest::full(block_id, page, self.geometry.superblock_degree),
                tick,
            );

            if self.free_block_ratio() < self.cfg.gc_threshold {
                let victims = self.select_victims(*tick);

                // Collection shares the write's tick window; its cost shows
                // up as timeline occupancy, not added host latency.
                let mut gc_tick = *tick;
                self.collect_garbage(&victims, pal, &mut gc_tick);
            }
        }
    }

    pub fn trim(&mut self, lpn: u64, _tick: &mut Tick) {
        if let Some((block_id, page)) = self.table.remove(&lpn) {
            self.blocks
                .get_mut(&block_id)
                .expect("mapped block is not in use")
                .invalidate(page);
        }
    }

    /// Invalidate every mapped LPN in `range` and erase the touched blocks
    /// through collection on that subset.
    pub fn format(&mut self, range: LpnRange, pal: &mut Pal, tick: &mut Tick) {
        let mut touched: Vec<u64> = Vec::new();
        let in_range: Vec<u64> = self
            .table
            .keys()
            .copied()
            .filter(|lpn| *lpn >= range.slpn && *lpn < range.slpn + range.nlp)
            .collect();

        for lpn in in_range {
            let (block_id, page) = self.table.remove(&lpn).unwrap();

            self.blocks
                .get_mut(&block_id)
                .expect("mapped block is not in use")
                .invalidate(page);
            touched.push(block_id);
        }

        touched.sort_unstable();
        touched.dedup();
        // The open block is only reclaimable once it has filled up.
        touched.retain(|id| *id != self.last_free_block || self.blocks[id].is_full());

        *tick = self.collect_garbage(&touched, pal, tick);
    }

    /// Blocks to reclaim, cheapest first.
    pub fn select_victims(&mut self, tick: Tick) -> Vec<u64> {
        let mut n_blocks = match self.cfg.gc_mode {
            GcMode::Static => u64::from(self.cfg.reclaim_blocks),
            GcMode::Threshold => {
                let target = (self.total_blocks as f64 * self.cfg.reclaim_threshold) as u64;

                target.saturating_sub(self.free_blocks.len() as u64)
            }
        };

        if self.reclaim_more {
            self.reclaim_more = false;
            n_blocks += 1;
        }

        let pages = f64::from(self.geometry.pages_per_block);
        let mut weight: Vec<(u64, f64)> = self
            .blocks
            .iter()
            .filter(|(id, block)| **id != self.last_free_block || block.is_full())
            .map(|(id, block)| {
                let w = match self.cfg.victim_policy {
                    VictimPolicy::Greedy => f64::from(block.valid_pages()),
                    VictimPolicy::CostBenefit => {
                        let u = f64::from(block.valid_pages()) / pages;
                        let age = tick.saturating_sub(block.last_accessed()).max(1) as f64;

                        u / ((1.0 - u) * age)
                    }
                };

                (*id, w)
            })
            .collect();

        weight.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
        weight.truncate(n_blocks as usize);
        weight.into_iter().map(|(id, _)| id).collect()
    }

    /// Copy the surviving pages of each victim, erase it, and return the
    /// largest finish tick across victims.
    pub fn collect_garbage(&mut self, victims: &[u64], pal: &mut Pal, tick: &mut Tick) -> Tick {
        if victims.is_empty() {
            return *tick;
        }

        debug!(?victims, at = *tick, "garbage collection");

        let degree = self.geometry.superblock_degree;
        let mut finished = *tick;

        for &victim_id in victims {
            let mut victim_tick = *tick;

            assert!(
                self.blocks.contains_key(&victim_id),
                "victim block {victim_id} is not in use"
            );

            for page in 0..self.geometry.pages_per_block {
                let Some(lpn) = self.blocks[&victim_id].page_lpn(page) else {
                    continue;
                };

                // Move the page: read it, program it into the current free
                // block, drop the old copy.
                pal.read(&PalRequest::full(victim_id, page, degree), &mut victim_tick);

                let dest_id = self.last_free_block_id();
                let dest = self.blocks.get_mut(&dest_id).expect("free block missing");
                let dest_page = dest.next_write_page();

                dest.write(dest_page, lpn, victim_tick);
                self.table.insert(lpn, (dest_id, dest_page));
                pal.write(&PalRequest::full(dest_id, dest_page, degree), &mut victim_tick);

                self.blocks
                    .get_mut(&victim_id)
                    .unwrap()
                    .invalidate(page);
            }

            self.erase_block(victim_id, pal, &mut victim_tick);
            finished = finished.max(victim_tick);
        }

        finished
    }

    fn erase_block(&mut self, block_id: u64, pal: &mut Pal, tick: &mut Tick) {
        let mut block = self
            .blocks
            .remove(&block_id)
            .expect("erase of a block that is not in use");

        assert_eq!(
            block.valid_pages(),
            0,
            "erase of block {block_id} with valid pages"
        );

        block.erase();
        pal.erase(
            &PalRequest::full(block_id, 0, self.geometry.superblock_degree),
            tick,
        );

        if block.erase_count() < self.cfg.erase_cycle {
            self.free_blocks.insert((block.erase_count(), block_id), block);
        } else {
            block.mark_bad();
            debug!(block = block_id, "block retired as bad");
            // Retired blocks simply leave the pool; capacity shrinks.
        }

        if block_id == self.last_free_block {
            self.last_free_block = self.take_free_block();
        }
    }

    /// Current open block, promoting a fresh one when it fills up.
    fn last_free_block_id(&mut self) -> u64 {
        let block = self
            .blocks
            .get(&self.last_free_block)
            .expect("open block is not in use");

        if block.is_full() {
            self.last_free_block = self.take_free_block();
            self.reclaim_more = true;
        }

        self.last_free_block
    }

    /// Serialize the translation state: mapping table, in-use blocks, free
    /// pool, and the open-block cursor. Only valid against identical
    /// geometry.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&self.total_blocks.to_le_bytes())?;
        w.write_all(&self.geometry.pages_per_block.to_le_bytes())?;
        w.write_all(&self.last_free_block.to_le_bytes())?;
        w.write_all(&[self.reclaim_more as u8])?;

        w.write_all(&(self.blocks.len() as u64).to_le_bytes())?;
        let mut in_use: Vec<_> = self.blocks.iter().collect();
        in_use.sort_by_key(|(id, _)| **id);
        for (id, block) in in_use {
            w.write_all(&id.to_le_bytes())?;
            block.save(w)?;
        }

        w.write_all(&(self.free_blocks.len() as u64).to_le_bytes())?;
        for ((_, id), block) in &self.free_blocks {
            w.write_all(&id.to_le_bytes())?;
            block.save(w)?;
        }

        w.write_all(&(self.table.len() as u64).to_le_bytes())?;
        let mut entries: Vec<_> = self.table.iter().collect();
        entries.sort_by_key(|(lpn, _)| **lpn);
        for (lpn, (block, page)) in entries {
            w.write_all(&lpn.to_le_bytes())?;
            w.write_all(&block.to_le_bytes())?;
            w.write_all(&page.to_le_bytes())?;
        }

        Ok(())
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> std::io::Result<()> {
        use flint_core::checkpoint::{invalid_data, read_bool, read_u32, read_u64};

        let total = read_u64(r)?;
        let pages = read_u32(r)?;

        if total != self.total_blocks || pages != self.geometry.pages_per_block {
            return Err(invalid_data("checkpoint geometry mismatch"));
        }

        self.last_free_block = read_u64(r)?;
        self.reclaim_more = read_bool(r)?;

        self.blocks.clear();
        let in_use = read_u64(r)?;
        for _ in 0..in_use {
            let id = read_u64(r)?;

            self.blocks.insert(id, Block::restore(r, pages)?);
        }

        self.free_blocks.clear();
        let free = read_u64(r)?;
        for _ in 0..free {
            let id = read_u64(r)?;
            let block = Block::restore(r, pages)?;

            self.free_blocks.insert((block.erase_count(), id), block);
        }

        self.table.clear();
        let entries = read_u64(r)?;
        for _ in 0..entries {
            let lpn = read_u64(r)?;
            let block = read_u64(r)?;
            let page = read_u32(r)?;

            self.table.insert(lpn, (block, page));
        }

        Ok(())
    }

    /// Pop the least-worn block from the free pool into the in-use set.
    fn take_free_block(&mut self) -> u64 {
        let Some(((_, id), block)) = self.free_blocks.pop_first() else {
            panic!("free block pool exhausted; overprovisioning is insufficient for this workload");
        };

        assert!(
            !self.blocks.contains_key(&id),
            "free block {id} already in use"
        );
        self.blocks.insert(id, block);

        id
    }
}
