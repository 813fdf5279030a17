//! ND-100 physical memory.
//!
//! A flat array of 16-bit words, up to 512K words with normal page tables.
//! The CPU reaches it only through the MMU; devices use the DMA entry points,
//! which never trap and only report an out-of-range address.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default physical memory size in words.
pub const MEMORY_WORDS: usize = 512 * 1024;

/// A physical address beyond the installed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("physical address {0:#o} out of range")]
pub struct OutOfRange(pub u32);

/// Physical memory.
#[derive(Clone, Serialize, Deserialize)]
pub struct Memory {
    words: Vec<u16>,
}

impl Memory {
    /// Create the default 512K-word memory, zeroed.
    pub fn new() -> Self {
        Self::with_size(MEMORY_WORDS)
    }

    /// Create a zeroed memory of `words` words.
    pub fn with_size(words: usize) -> Self {
        Self {
            words: vec![0; words],
        }
    }

    /// Installed size in words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True if no memory is installed.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Read a physical word.
    #[inline]
    pub fn read(&self, addr: u32) -> Result<u16, OutOfRange> {
        self.words.get(addr as usize).copied().ok_or(OutOfRange(addr))
    }

    /// Write a physical word.
    #[inline]
    pub fn write(&mut self, addr: u32, value: u16) -> Result<(), OutOfRange> {
        match self.words.get_mut(addr as usize) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(OutOfRange(addr)),
        }
    }

    /// Device-context read.
    pub fn dma_read(&self, addr: u32) -> Result<u16, OutOfRange> {
        self.read(addr)
    }

    /// Device-context write.
    pub fn dma_write(&mut self, addr: u32, value: u16) -> Result<(), OutOfRange> {
        self.write(addr, value)
    }

    /// Load a program into memory starting at the given physical address.
    pub fn load_program(&mut self, start_addr: u32, program: &[u16]) -> Result<(), MemoryError> {
        let start = start_addr as usize;
        if start > self.words.len() || program.len() > self.words.len() - start {
            return Err(MemoryError::ProgramTooLarge {
                size: program.len(),
                available: self.words.len().saturating_sub(start),
            });
        }
        self.words[start..start + program.len()].copy_from_slice(program);
        Ok(())
    }

    /// Dump memory contents (for debugging).
    pub fn dump(&self, start: u32, count: usize) -> Vec<(u32, u16)> {
        let start = start as usize;
        let end = start.saturating_add(count).min(self.words.len());
        (start..end).map(|i| (i as u32, self.words[i])).collect()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let non_zero = self.words.iter().filter(|w| **w != 0).count();
        f.debug_struct("Memory")
            .field("non_zero_words", &non_zero)
            .field("total_words", &self.words.len())
            .finish()
    }
}

/// Errors that can occur loading memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),

    #[error("program size {size} exceeds available space {available}")]
    ProgramTooLarge { size: usize, available: usize },
}
