//! Busy/free ledger of a single scheduled resource (one channel or one
//! die).
//!
//! Each resource keeps two views of the same reservations: an ordered map
//! of busy slots (for statistics and invariant checks) and a length-keyed
//! map of interior free slots, with a right-edge watermark marking where
//! the open-ended free tail begins. Old busy slots are periodically folded
//! into an accumulated busy-tick total and dropped.

use std::collections::{BTreeMap, BTreeSet};

use flint_core::Tick;

/// Half-open busy interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub start: Tick,
    pub end: Tick,
}

impl TimeSlot {
    pub fn len(&self) -> Tick {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    /// start -> end, pairwise disjoint.
    busy: BTreeMap<Tick, Tick>,
    /// start -> length of interior free holes (left of `start_point`).
    free_by_start: BTreeMap<Tick, Tick>,
    /// length -> starts, for best-fit lookup.
    free_by_len: BTreeMap<Tick, BTreeSet<Tick>>,
    /// Start of the rightmost, open-ended free interval.
    start_point: Tick,
    /// Busy ticks folded out by `flush`.
    flushed_busy: Tick,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest `start >= from` such that `[start, start + need)` does not
    /// overlap any busy slot. Falls back to the open tail when no interior
    /// hole fits.
    pub fn find_free_time(&self, need: Tick, from: Tick) -> Tick {
        if from >= self.start_point {
            return from;
        }

        // The hole containing `from`, if any, is the only one that can
        // grant `from` itself.
        if let Some((&start, &len)) = self.free_by_start.range(..=from).next_back() {
            if start + len > from && start + len - from >= need {
                return from;
            }
        }

        // Otherwise pick the earliest adequately long hole after `from`.
        let mut best: Option<Tick> = None;

        for (_, starts) in self.free_by_len.range(need..) {
            if let Some(&start) = starts.range(from..).next() {
                best = Some(match best {
                    Some(b) => b.min(start),
                    None => start,
                });
            }
        }

        best.unwrap_or(self.start_point)
    }

    /// Mark `[start, start + len)` busy. The window must have been obtained
    /// from `find_free_time`; overlapping an existing busy slot is a
    /// scheduler invariant violation.
    pub fn reserve(&mut self, start: Tick, len: Tick) {
        if len == 0 {
            return;
        }

        let end = start + len;

        if let Some((&prev_start, &prev_end)) = self.busy.range(..end).next_back() {
            assert!(
                prev_end <= start || prev_start >= end,
                "timeline reservation [{start}, {end}) overlaps busy slot [{prev_start}, {prev_end})"
            );
        }

        // Merge adjacent busy slots so the ledger stays compact.
        let mut slot = TimeSlot { start, end };

        if let Some((&ls, &le)) = self.busy.range(..=start).next_back() {
            if le == start {
                self.busy.remove(&ls);
                slot.start = ls;
            }
        }
        if let Some(&re) = self.busy.get(&end) {
            self.busy.remove(&end);
            slot.end = re;
        }
        self.busy.insert(slot.start, slot.end);

        if start >= self.start_point {
            // Carve from the open tail; the skipped gap becomes an interior
            // hole.
            if start > self.start_point {
                self.add_free(self.start_point, start - self.start_point);
            }

            self.start_point = end;
            return;
        }

        // Carve from the interior hole containing the window.
        let (&hole_start, &hole_len) = self
            .free_by_start
            .range(..=start)
            .next_back()
            .expect("reservation outside any free interval");
        let hole_end = hole_start + hole_len;

        assert!(
            end <= hole_end,
            "reservation [{start}, {end}) exceeds free hole [{hole_start}, {hole_end})"
        );

        self.remove_free(hole_start, hole_len);

        if start > hole_start {
            self.add_free(hole_start, start - hole_start);
        }
        if end < hole_end {
            self.add_free(end, hole_end - end);
        }
    }

    /// Fold every busy slot ending before `cut` into the accumulated busy
    /// total and drop it, along with interior free holes entirely below
    /// `cut`.
    pub fn flush(&mut self, cut: Tick) {
        let expired: Vec<Tick> = self
            .busy
            .iter()
            .take_while(|(_, &end)| end < cut)
            .map(|(&start, _)| start)
            .collect();

        for start in expired {
            let end = self.busy.remove(&start).unwrap();

            self.flushed_busy += end - start;
        }

        let dead: Vec<(Tick, Tick)> = self
            .free_by_start
            .iter()
            .take_while(|(&start, &len)| start + len < cut)
            .map(|(&start, &len)| (start, len))
            .collect();

        for (start, len) in dead {
            self.remove_free(start, len);
        }
    }

    /// Total busy ticks, including flushed history.
    pub fn busy_total(&self) -> Tick {
        self.flushed_busy + self.busy.iter().map(|(s, e)| e - s).sum::<Tick>()
    }

    pub fn busy_slots(&self) -> impl Iterator<Item = TimeSlot> + '_ {
        self.busy.iter().map(|(&start, &end)| TimeSlot { start, end })
    }

    pub fn start_point(&self) -> Tick {
        self.start_point
    }

    /// Serialize busy slots, interior holes, and the watermark; the
    /// length-keyed view is rebuilt on restore.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::write_u64;

        write_u64(w, self.busy.len() as u64)?;
        for (&start, &end) in &self.busy {
            write_u64(w, start)?;
            write_u64(w, end)?;
        }

        write_u64(w, self.free_by_start.len() as u64)?;
        for (&start, &len) in &self.free_by_start {
            write_u64(w, start)?;
            write_u64(w, len)?;
        }

        write_u64(w, self.start_point)?;
        write_u64(w, self.flushed_busy)
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> std::io::Result<()> {
        use flint_core::checkpoint::read_u64;

        self.busy.clear();
        self.free_by_start.clear();
        self.free_by_len.clear();

        let busy = read_u64(r)?;
        for _ in 0..busy {
            let start = read_u64(r)?;
            let end = read_u64(r)?;

            self.busy.insert(start, end);
        }

        let holes = read_u64(r)?;
        for _ in 0..holes {
            let start = read_u64(r)?;
            let len = read_u64(r)?;

            self.add_free(start, len);
        }

        self.start_point = read_u64(r)?;
        self.flushed_busy = read_u64(r)?;

        Ok(())
    }

    fn add_free(&mut self, start: Tick, len: Tick) {
        self.free_by_start.insert(start, len);
        self.free_by_len.entry(len).or_default().insert(start);
    }

    fn remove_free(&mut self, start: Tick, len: Tick) {
        self.free_by_start.remove(&start);

        if let Some(starts) = self.free_by_len.get_mut(&len) {
            starts.remove(&start);

            if starts.is_empty() {
                self.free_by_len.remove(&len);
            }
        }
    }
}
