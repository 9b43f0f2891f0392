//! Cyclic allocator for per-session listener ports.
//!
//! The pool itself is not synchronized; [`crate::registry::SessionRegistry`]
//! keeps it inside the same lock as the unit map so that port binding and
//! registry membership change together.

use std::collections::HashSet;
use std::ops::RangeInclusive;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    cursor: u16,
    bound: HashSet<u16>,
}

impl PortPool {
    /// Create a pool over the inclusive range `start..=end`.
    ///
    /// Callers validate the range; an inverted range yields a pool that is
    /// always exhausted.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let (start, end) = range.into_inner();
        Self {
            start,
            end,
            cursor: start,
            bound: HashSet::new(),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    /// Number of currently bound ports.
    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.bound.contains(&port)
    }

    /// Hand out the next free port at or after the cursor.
    ///
    /// Bound ports are skipped; the search visits each port in the range at
    /// most once before reporting exhaustion.
    pub fn allocate(&mut self) -> Result<u16, PoolError> {
        for _ in 0..self.capacity() {
            let candidate = self.cursor;
            self.advance();
            if self.bound.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(PoolError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Mark `port` free. Returns `false` if it was not bound.
    pub fn release(&mut self, port: u16) -> bool {
        self.bound.remove(&port)
    }

    fn advance(&mut self) {
        self.cursor = if self.cursor >= self.end {
            self.start
        } else {
            self.cursor + 1
        };
    }
}
