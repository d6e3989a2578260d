//! Allocation vector: one bit per block, set = in use.
//!
//! Never stored on disk. It is rebuilt from the directory on mount and
//! kept in step with every allocate and free afterwards.

use crate::dirent::RawEntry;
use crate::error::{CpmError, CpmResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationVector {
    data: Vec<u8>,
    size: usize,
    /// First block after the directory area
    first_data: usize,
}

impl AllocationVector {
    /// Vector for `size` blocks with the first `directory_blocks` reserved.
    pub fn new(size: usize, directory_blocks: usize) -> Self {
        let mut vector = Self {
            data: vec![0u8; size.div_ceil(8)],
            size,
            first_data: directory_blocks.min(size),
        };
        for block in 0..vector.first_data {
            vector.set(block);
        }
        vector
    }

    /// Rebuild from the file entries of a directory.
    ///
    /// Pointers beyond the end of the volume are logged and ignored.
    pub fn rebuild<'a, I>(size: usize, directory_blocks: usize, wide: bool, entries: I) -> Self
    where
        I: IntoIterator<Item = &'a RawEntry>,
    {
        let mut vector = Self::new(size, directory_blocks);
        for entry in entries {
            for block in entry.pointers(wide).filter(|&b| b != 0) {
                if (block as usize) < size {
                    vector.set(block as usize);
                } else {
                    log::warn!(
                        "{} points at block {} beyond volume of {} blocks",
                        entry.cpm_name(),
                        block,
                        size
                    );
                }
            }
        }
        vector
    }

    fn set(&mut self, block: usize) {
        self.data[block / 8] |= 1 << (block % 8);
    }

    fn clear(&mut self, block: usize) {
        self.data[block / 8] &= !(1 << (block % 8));
    }

    pub fn is_used(&self, block: usize) -> bool {
        block < self.size && self.data[block / 8] & (1 << (block % 8)) != 0
    }

    /// Total blocks tracked.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn first_data_block(&self) -> usize {
        self.first_data
    }

    pub fn count_used(&self) -> usize {
        (0..self.size).filter(|&b| self.is_used(b)).count()
    }

    pub fn count_free(&self) -> usize {
        self.size - self.count_used()
    }

    /// Take the `count` lowest free blocks.
    ///
    /// Either all requested blocks are marked used and returned, or none
    /// are and `NoSpace` comes back.
    pub fn allocate(&mut self, count: usize) -> CpmResult<Vec<u16>> {
        let mut taken = Vec::with_capacity(count);
        for block in self.first_data..self.size {
            if taken.len() == count {
                break;
            }
            if !self.is_used(block) {
                self.set(block);
                taken.push(block as u16);
            }
        }
        if taken.len() < count {
            for &block in &taken {
                self.clear(block as usize);
            }
            return Err(CpmError::NoSpace);
        }
        log::trace!("allocated blocks {:?}", taken);
        Ok(taken)
    }

    /// Take one block.
    pub fn allocate_one(&mut self) -> CpmResult<u16> {
        self.allocate(1).map(|blocks| blocks[0])
    }

    /// Release blocks. Freeing a free block is a no-op; the directory area
    /// and out-of-range numbers are never touched.
    pub fn free(&mut self, blocks: &[u16]) {
        for &block in blocks {
            let index = block as usize;
            if index < self.first_data || index >= self.size {
                log::warn!("refusing to free block {}", block);
                continue;
            }
            if !self.is_used(index) {
                log::warn!("block {} freed twice", block);
            }
            self.clear(index);
        }
    }
}
