//! First-fit allocator over the kernel's value stack.
//!
//! Each cell carries a use count; a cell is free when its count is zero. One producer slot
//! is held once no matter how many consumers read it. Allocation takes the
//! lowest run of free cells long enough for the request. When no run fits, the allocator
//! switches into a sticky exhausted state: every later request returns offset 0 and releases
//! become no-ops, so compilation can run to completion before the caller discards the result.
use crate::svm::opcode::STACK_INVALID;

#[derive(Clone, Debug)]
pub struct StackAllocator {
    users: Vec<u32>,
    peak: usize,
    exhausted: bool,
}

impl StackAllocator {
    /// Creates an allocator over `capacity` free cells.
    pub fn new(capacity: usize) -> Self {
        Self {
            users: vec![0; capacity],
            peak: 0,
            exhausted: false,
        }
    }

    /// Total number of cells.
    pub fn capacity(&self) -> usize {
        self.users.len()
    }

    /// Reserves `size` contiguous cells and returns the first offset.
    ///
    /// A zero-sized request (closures) reserves nothing and returns [`STACK_INVALID`].
    pub fn find_offset(&mut self, size: usize) -> u32 {
        if size == 0 {
            return STACK_INVALID;
        }
        if self.exhausted {
            return 0;
        }

        let mut run = 0;
        for i in 0..self.users.len() {
            if self.users[i] == 0 {
                run += 1;
            } else {
                run = 0;
            }
            if run == size {
                let start = i + 1 - size;
                for cell in &mut self.users[start..=i] {
                    *cell = 1;
                }
                self.peak = self.peak.max(i + 1);
                return start as u32;
            }
        }

        self.exhausted = true;
        0
    }

    /// Drops one user from each cell of the range.
    pub fn release(&mut self, offset: u32, size: usize) {
        if self.exhausted || offset == STACK_INVALID {
            return;
        }
        let start = offset as usize;
        for cell in &mut self.users[start..start + size] {
            debug_assert!(*cell > 0, "releasing free stack cell {start}");
            *cell = cell.saturating_sub(1);
        }
    }

    /// Whether no cell of the range is held.
    pub fn is_free(&self, offset: u32, size: usize) -> bool {
        let start = offset as usize;
        self.users
            .get(start..start + size)
            .is_some_and(|cells| cells.iter().all(|&u| u == 0))
    }

    /// Number of cells currently held.
    pub fn live_cells(&self) -> usize {
        self.users.iter().filter(|&&u| u > 0).count()
    }

    /// Highest cell index ever reserved, plus one.
    pub fn peak_usage(&self) -> usize {
        self.peak
    }

    /// Whether a request has failed since creation.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
