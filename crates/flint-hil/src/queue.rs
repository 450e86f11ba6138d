//! Submission and completion queue ring state.
//!
//! The rings live in host memory behind a DMA tag; the controller owns the
//! head/tail indices and the completion-side phase bit.

use crate::dma::DmaTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    Urgent,
    High,
    Medium,
    Low,
}

#[derive(Debug)]
pub struct SubQueue {
    id: u16,
    cq_id: u16,
    size: u16,
    head: u16,
    tail: u16,
    priority: QueuePriority,
    base: DmaTag,
}

impl SubQueue {
    pub fn new(id: u16, size: u16, cq_id: u16, priority: QueuePriority, base: DmaTag) -> Self {
        Self {
            id,
            cq_id,
            size,
            head: 0,
            tail: 0,
            priority,
            base,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn cq_id(&self) -> u16 {
        self.cq_id
    }

    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    pub fn base(&self) -> DmaTag {
        self.base
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn item_count(&self) -> u16 {
        (self.tail + self.size - self.head) % self.size
    }

    /// Tail doorbell write. Out-of-range values are a host protocol error
    /// surfaced by the caller; the ring itself saturates defensively.
    pub fn set_tail(&mut self, tail: u16) -> bool {
        if tail >= self.size {
            return false;
        }

        self.tail = tail;
        true
    }

    /// Take the current head slot and advance past it.
    pub fn consume_head(&mut self) -> u16 {
        debug_assert!(self.item_count() > 0, "consume from an empty ring");

        let slot = self.head;

        self.head = (self.head + 1) % self.size;
        slot
    }

    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_u16, write_u64, write_u8};

        write_u16(w, self.id)?;
        write_u16(w, self.cq_id)?;
        write_u16(w, self.size)?;
        write_u16(w, self.head)?;
        write_u16(w, self.tail)?;
        write_u8(w, priority_tag(self.priority))?;
        write_u64(w, self.base)
    }

    pub fn restore(r: &mut impl std::io::Read) -> std::io::Result<Self> {
        use flint_core::checkpoint::{read_u16, read_u64, read_u8};

        Ok(Self {
            id: read_u16(r)?,
            cq_id: read_u16(r)?,
            size: read_u16(r)?,
            head: read_u16(r)?,
            tail: read_u16(r)?,
            priority: priority_from_tag(read_u8(r)?)?,
            base: read_u64(r)?,
        })
    }
}

fn priority_tag(priority: QueuePriority) -> u8 {
    match priority {
        QueuePriority::Urgent => 0,
        QueuePriority::High => 1,
        QueuePriority::Medium => 2,
        QueuePriority::Low => 3,
    }
}

fn priority_from_tag(tag: u8) -> std::io::Result<QueuePriority> {
    Ok(match tag {
        0 => QueuePriority::Urgent,
        1 => QueuePriority::High,
        2 => QueuePriority::Medium,
        3 => QueuePriority::Low,
        other => {
            return Err(flint_core::checkpoint::invalid_data(format!(
                "bad queue priority tag {other}"
            )))
        }
    })
}

#[derive(Debug)]
pub struct CompQueue {
    id: u16,
    size: u16,
    head: u16,
    tail: u16,
    phase: bool,
    iv: u16,
    interrupts_enabled: bool,
    base: DmaTag,
}

impl CompQueue {
    pub fn new(id: u16, size: u16, iv: u16, interrupts_enabled: bool, base: DmaTag) -> Self {
        Self {
            id,
            size,
            head: 0,
            tail: 0,
            phase: true,
            iv,
            interrupts_enabled,
            base,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn iv(&self) -> u16 {
        self.iv
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    pub fn base(&self) -> DmaTag {
        self.base
    }

    pub fn item_count(&self) -> u16 {
        (self.tail + self.size - self.head) % self.size
    }

    pub fn set_head(&mut self, head: u16) -> bool {
        if head >= self.size {
            return false;
        }

        self.head = head;
        true
    }

    /// Allocate the tail slot for a new entry; returns `(slot, phase)` and
    /// flips the phase bit when the tail wraps.
    pub fn push_slot(&mut self) -> (u16, bool) {
        let slot = self.tail;
        let phase = self.phase;

        self.tail = (self.tail + 1) % self.size;

        if self.tail == 0 {
            self.phase = !self.phase;
        }

        (slot, phase)
    }

    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_bool, write_u16, write_u64};

        write_u16(w, self.id)?;
        write_u16(w, self.size)?;
        write_u16(w, self.head)?;
        write_u16(w, self.tail)?;
        write_bool(w, self.phase)?;
        write_u16(w, self.iv)?;
        write_bool(w, self.interrupts_enabled)?;
        write_u64(w, self.base)
    }

    pub fn restore(r: &mut impl std::io::Read) -> std::io::Result<Self> {
        use flint_core::checkpoint::{read_bool, read_u16, read_u64};

        Ok(Self {
            id: read_u16(r)?,
            size: read_u16(r)?,
            head: read_u16(r)?,
            tail: read_u16(r)?,
            phase: read_bool(r)?,
            iv: read_u16(r)?,
            interrupts_enabled: read_bool(r)?,
            base: read_u64(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sq_ring_accounting_wraps() {
        let mut sq = SubQueue::new(1, 4, 1, QueuePriority::High, 0);

        assert_eq!(sq.item_count(), 0);
        assert!(sq.set_tail(2));
        assert_eq!(sq.item_count(), 2);

        assert_eq!(sq.consume_head(), 0);
        assert_eq!(sq.consume_head(), 1);
        assert_eq!(sq.item_count(), 0);

        // Wrap: tail behind head numerically.
        assert!(sq.set_tail(1));
        assert_eq!(sq.item_count(), 3);
        assert!(!sq.set_tail(9));
    }

    #[test]
    fn cq_phase_flips_on_wrap() {
        let mut cq = CompQueue::new(1, 2, 0, true, 0);

        assert_eq!(cq.push_slot(), (0, true));
        assert_eq!(cq.push_slot(), (1, true));
        // Wrapped: next pass uses the inverted phase.
        assert_eq!(cq.push_slot(), (0, false));
    }
}
