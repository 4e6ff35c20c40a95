//! Backing memory implemented
//! with a two-level page table

use super::BackingStore;
use super::WORD_BYTES;
use crate::error::MemoryError;

const WORD_WIDTH: usize = 32;
const FIRST_LEVEL_WIDTH: usize = 10;
const SECOND_LEVEL_WIDTH: usize = 10;
const PAGE_WIDTH: usize = 12;

const FIRST_LEVEL_SIZE: usize = 1 << FIRST_LEVEL_WIDTH;
const SECOND_LEVEL_SIZE: usize = 1 << SECOND_LEVEL_WIDTH;
const PAGE_SIZE: usize = 1 << PAGE_WIDTH;

// Defines page type
type PageType = Box<[u8; PAGE_SIZE]>;

/// Memory management unit
pub struct MMU {
    // data[x][y][z] stores the byte (u8) at (x << 22) | (y << 12) | z
    // Pages are allocated on first write; unwritten memory reads as zero
    data: Vec<Option<Vec<Option<PageType>>>>,

    /// Number of words read through the backing-store port
    pub words_read: u64,
    /// Number of words written through the backing-store port
    pub words_written: u64,
}

impl Default for MMU {
    fn default() -> Self {
        Self::make()
    }
}

impl MMU {
    /// Make a new, empty MMU
    pub fn make() -> Self {
        Self {
            data: vec![None; FIRST_LEVEL_SIZE],
            words_read: 0,
            words_written: 0,
        }
    }

    /// The first-level index of the address
    fn get_first_level_index(address: u32) -> usize {
        (address >> (WORD_WIDTH - FIRST_LEVEL_WIDTH)) as usize
    }
    /// The second-level index of the address
    fn get_second_level_index(address: u32) -> usize {
        ((address >> (WORD_WIDTH - FIRST_LEVEL_WIDTH - SECOND_LEVEL_WIDTH))
            & ((SECOND_LEVEL_SIZE - 1) as u32)) as usize
    }
    /// The page offset
    fn get_page_offset(address: u32) -> usize {
        (address & ((PAGE_SIZE - 1) as u32)) as usize
    }

    /// Check if a page is allocated at the given address
    pub fn page_exists(&self, address: u32) -> bool {
        let (i, j) = (
            Self::get_first_level_index(address),
            Self::get_second_level_index(address),
        );

        match &self.data[i] {
            Some(second_level) => second_level[j].is_some(),
            None => false,
        }
    }

    /// Returns the page holding the address, allocating it if needed
    fn page_mut(&mut self, address: u32) -> &mut PageType {
        let (i, j) = (
            Self::get_first_level_index(address),
            Self::get_second_level_index(address),
        );

        let second_level =
            self.data[i].get_or_insert_with(|| vec![None; SECOND_LEVEL_SIZE]);
        second_level[j].get_or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }

    /// Set the byte at the given address
    pub fn set8(&mut self, address: u32, byte: u8) {
        let k = Self::get_page_offset(address);
        self.page_mut(address)[k] = byte;
    }

    /// Get the byte at the given address
    pub fn get8(&self, address: u32) -> u8 {
        let (i, j, k) = (
            Self::get_first_level_index(address),
            Self::get_second_level_index(address),
            Self::get_page_offset(address),
        );

        self.data[i]
            .as_ref()
            .and_then(|second_level| second_level[j].as_ref())
            .map_or(0, |page| page[k])
    }

    /// Little-endian word read; the address must be word aligned
    pub fn get32(&self, address: u32) -> Result<u32, MemoryError> {
        check_alignment(address)?;
        Ok(self.load_word(address))
    }

    /// Little-endian word write; the address must be word aligned
    pub fn set32(&mut self, address: u32, value: u32) -> Result<(), MemoryError> {
        check_alignment(address)?;
        self.store_word(address, value);
        Ok(())
    }

    // An aligned word never straddles a page
    fn load_word(&self, aligned: u32) -> u32 {
        let k = Self::get_page_offset(aligned);
        let (i, j) = (
            Self::get_first_level_index(aligned),
            Self::get_second_level_index(aligned),
        );
        self.data[i]
            .as_ref()
            .and_then(|second_level| second_level[j].as_ref())
            .map_or(0, |page| {
                u32::from_le_bytes([page[k], page[k + 1], page[k + 2], page[k + 3]])
            })
    }

    fn store_word(&mut self, aligned: u32, value: u32) {
        let k = Self::get_page_offset(aligned);
        let page = self.page_mut(aligned);
        page[k..k + WORD_BYTES as usize].copy_from_slice(&value.to_le_bytes());
    }
}

fn check_alignment(address: u32) -> Result<(), MemoryError> {
    if address % WORD_BYTES != 0 {
        return Err(MemoryError::AlignmentError(address, WORD_BYTES));
    }
    Ok(())
}

/// Word port used by the caches. The low two address bits are
/// dropped, so any address selects the word that contains it.
impl BackingStore for MMU {
    fn read_word(&mut self, address: u32) -> u32 {
        self.words_read += 1;
        self.load_word(address & !(WORD_BYTES - 1))
    }

    fn write_word(&mut self, address: u32, value: u32) {
        self.words_written += 1;
        self.store_word(address & !(WORD_BYTES - 1), value);
    }
}
