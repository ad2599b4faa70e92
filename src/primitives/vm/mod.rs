//! Paged virtual memory over column files.
//!
//! A column file is exposed as a sequence of power-of-two sized pages. All
//! offset arithmetic is done with shifts and masks against `bits`, the page
//! size exponent, which callers may rely on.

mod append;

pub use append::AppendMemory;

use crate::types::{Result, StoreError};

/// Smallest supported page size exponent (8 bytes).
pub const MIN_PAGE_BITS: u32 = 3;
/// Largest supported page size exponent (1 GiB).
pub const MAX_PAGE_BITS: u32 = 30;
/// Default page size exponent for column files (16 MiB).
pub const DEFAULT_PAGE_BITS: u32 = 24;

/// Page lifecycle shared by the memory region flavours.
pub trait PagedMemory {
    /// Page size in bytes, always `1 << bits`.
    fn page_size(&self) -> usize;
    /// Maps the page following the current one and makes it the writable page.
    fn allocate_next_page(&mut self) -> Result<()>;
    /// Unmaps the current page.
    fn release_page(&mut self) -> Result<()>;
    /// Bytes of `page` when it is currently mapped.
    fn page_address(&self, page: u32) -> Option<&[u8]>;
}

/// Validates a page size exponent.
pub fn check_page_bits(bits: u32) -> Result<()> {
    if (MIN_PAGE_BITS..=MAX_PAGE_BITS).contains(&bits) {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!(
            "page size exponent {bits} outside {MIN_PAGE_BITS}..={MAX_PAGE_BITS}"
        )))
    }
}

/// Page holding logical `offset`.
#[inline]
pub fn page_index(offset: u64, bits: u32) -> u64 {
    offset >> bits
}

/// Logical offset of the first byte of `page`.
#[inline]
pub fn page_offset(page: u64, bits: u32) -> u64 {
    page << bits
}

/// Position of `offset` inside its page.
#[inline]
pub fn offset_in_page(offset: u64, bits: u32) -> usize {
    (offset & ((1u64 << bits) - 1)) as usize
}
