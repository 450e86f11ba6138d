//! Physical (super)block bookkeeping.
//!
//! Pages within a block must be programmed in ascending order: the write
//! pointer only advances, and skipped pages become invalid. The conserved
//! quantity is `valid + invalid + free = pages_per_block` with
//! `write_pointer = valid + invalid`.

use flint_core::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Block {
    states: Vec<PageState>,
    /// LPN stored in each valid page, for garbage-collection copies.
    lpns: Vec<u64>,
    write_pointer: u32,
    erase_count: u32,
    bad: bool,
    last_accessed: Tick,
}

impl Block {
    pub fn new(pages_per_block: u32) -> Self {
        Self {
            states: vec![PageState::Free; pages_per_block as usize],
            lpns: vec![0; pages_per_block as usize],
            write_pointer: 0,
            erase_count: 0,
            bad: false,
            last_accessed: 0,
        }
    }

    pub fn pages(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn page_state(&self, page: u32) -> PageState {
        self.states[page as usize]
    }

    /// LPN held by `page` when it is valid.
    pub fn page_lpn(&self, page: u32) -> Option<u64> {
        (self.states[page as usize] == PageState::Valid).then(|| self.lpns[page as usize])
    }

    pub fn next_write_page(&self) -> u32 {
        self.write_pointer
    }

    pub fn is_full(&self) -> bool {
        self.write_pointer == self.pages()
    }

    pub fn read(&mut self, page: u32, tick: Tick) {
        assert_eq!(
            self.states[page as usize],
            PageState::Valid,
            "read of a non-valid page {page}"
        );

        self.last_accessed = tick;
    }

    /// Program `page` with `lpn`. Programming must be sequential; skipping
    /// ahead invalidates the skipped pages.
    pub fn write(&mut self, page: u32, lpn: u64, tick: Tick) {
        assert!(!self.is_full(), "write into a full block");
        assert!(
            page >= self.write_pointer,
            "non-sequential program: page {page} behind write pointer {}",
            self.write_pointer
        );

        while self.write_pointer < page {
            self.states[self.write_pointer as usize] = PageState::Invalid;
            self.write_pointer += 1;
        }

        self.states[page as usize] = PageState::Valid;
        self.lpns[page as usize] = lpn;
        self.write_pointer = page + 1;
        self.last_accessed = tick;
    }

    pub fn invalidate(&mut self, page: u32) {
        assert_eq!(
            self.states[page as usize],
            PageState::Valid,
            "invalidate of a non-valid page {page}"
        );

        self.states[page as usize] = PageState::Invalid;
    }

    pub fn erase(&mut self) {
        self.states.fill(PageState::Free);
        self.write_pointer = 0;
        self.erase_count += 1;
    }

    pub fn mark_bad(&mut self) {
        self.bad = true;
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn last_accessed(&self) -> Tick {
        self.last_accessed
    }

    pub fn valid_pages(&self) -> u32 {
        self.states
            .iter()
            .filter(|s| **s == PageState::Valid)
            .count() as u32
    }

    pub fn invalid_pages(&self) -> u32 {
        self.states
            .iter()
            .filter(|s| **s == PageState::Invalid)
            .count() as u32
    }

    pub fn free_pages(&self) -> u32 {
        self.states
            .iter()
            .filter(|s| **s == PageState::Free)
            .count() as u32
    }

    /// Serialize in declaration order: wear, access time, write pointer,
    /// bad flag, then per-page state + LPN.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&self.erase_count.to_le_bytes())?;
        w.write_all(&self.last_accessed.to_le_bytes())?;
        w.write_all(&self.write_pointer.to_le_bytes())?;
        w.write_all(&[self.bad as u8])?;

        for (state, lpn) in self.states.iter().zip(&self.lpns) {
            let tag = match state {
                PageState::Free => 0u8,
                PageState::Valid => 1,
                PageState::Invalid => 2,
            };

            w.write_all(&[tag])?;
            w.write_all(&lpn.to_le_bytes())?;
        }

        Ok(())
    }

    pub fn restore(r: &mut impl std::io::Read, pages_per_block: u32) -> std::io::Result<Self> {
        use flint_core::checkpoint::{invalid_data, read_bool, read_u32, read_u64, read_u8};

        let mut block = Block::new(pages_per_block);

        block.erase_count = read_u32(r)?;
        block.last_accessed = read_u64(r)?;
        block.write_pointer = read_u32(r)?;
        block.bad = read_bool(r)?;

        for idx in 0..pages_per_block as usize {
            block.states[idx] = match read_u8(r)? {
                0 => PageState::Free,
                1 => PageState::Valid,
                2 => PageState::Invalid,
                other => return Err(invalid_data(format!("bad page state tag {other}"))),
            };
            block.lpns[idx] = read_u64(r)?;
        }

        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conserved(block: &Block) -> bool {
        block.valid_pages() + block.invalid_pages() + block.free_pages() == block.pages()
            && block.next_write_page() == block.valid_pages() + block.invalid_pages()
    }

    #[test]
    fn sequential_writes_advance_pointer() {
        let mut block = Block::new(4);

        block.write(0, 10, 100);
        block.write(1, 11, 200);

        assert_eq!(block.next_write_page(), 2);
        assert_eq!(block.page_lpn(0), Some(10));
        assert_eq!(block.last_accessed(), 200);
        assert!(conserved(&block));
    }

    #[test]
    fn skipping_pages_invalidates_them() {
        let mut block = Block::new(4);

        block.write(2, 42, 0);

        assert_eq!(block.page_state(0), PageState::Invalid);
        assert_eq!(block.page_state(1), PageState::Invalid);
        assert_eq!(block.page_state(2), PageState::Valid);
        assert_eq!(block.next_write_page(), 3);
        assert!(conserved(&block));
    }

    #[test]
    #[should_panic(expected = "non-sequential")]
    fn rewriting_behind_pointer_panics() {
        let mut block = Block::new(4);

        block.write(1, 1, 0);
        block.write(0, 2, 0);
    }

    #[test]
    #[should_panic(expected = "full block")]
    fn writing_full_block_panics() {
        let mut block = Block::new(2);

        block.write(0, 0, 0);
        block.write(1, 1, 0);
        block.write(1, 2, 0);
    }

    #[test]
    fn erase_resets_and_counts() {
        let mut block = Block::new(4);

        block.write(0, 0, 0);
        block.write(1, 1, 0);
        block.invalidate(0);
        block.erase();

        assert_eq!(block.erase_count(), 1);
        assert_eq!(block.valid_pages(), 0);
        assert_eq!(block.free_pages(), 4);
        assert_eq!(block.next_write_page(), 0);
        assert!(conserved(&block));
    }
}
