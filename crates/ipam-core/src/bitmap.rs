//! Per-block address accounting.

/// Fixed-size free/used bitmap over the addresses of one block.
///
/// Offset `n` corresponds to the `n`th address of the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    words: Vec<u64>,
    size: u32,
    used: u32,
}

impl BlockBitmap {
    /// Creates an empty bitmap of `size` addresses.
    pub fn new(size: u32) -> Self {
        let words = size.div_ceil(64) as usize;
        Self {
            words: vec![0; words],
            size,
            used: 0,
        }
    }
    
    /// Number of addresses tracked.
    pub fn size(&self) -> u32 {
        self.size
    }
    
    /// Number of allocated addresses.
    pub fn used(&self) -> u32 {
        self.used
    }
    
    /// Number of free addresses.
    pub fn available(&self) -> u32 {
        self.size - self.used
    }
    
    /// True when nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
    
    /// True when every address is allocated.
    pub fn is_full(&self) -> bool {
        self.used == self.size
    }
    
    /// Whether `offset` is allocated. Out-of-range offsets are never allocated.
    pub fn is_set(&self, offset: u32) -> bool {
        if offset >= self.size {
            return false;
        }
        let (word, bit) = Self::position(offset);
        self.words[word] & (1 << bit) != 0
    }
    
    /// Marks the lowest free offset as allocated and returns it.
    pub fn allocate_first(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let (word, bits) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, bits)| **bits != u64::MAX)?;
        let offset = u32::try_from(word * 64).ok()? + bits.trailing_ones();
        if offset >= self.size {
            return None;
        }
        self.set(offset);
        Some(offset)
    }
    
    /// Marks `offset` as allocated. Returns false if it already was or is out of range.
    pub fn set(&mut self, offset: u32) -> bool {
        if offset >= self.size || self.is_set(offset) {
            return false;
        }
        let (word, bit) = Self::position(offset);
        self.words[word] |= 1 << bit;
        self.used += 1;
        true
    }
    
    /// Marks `offset` as free. Returns false if it was not allocated.
    pub fn clear(&mut self, offset: u32) -> bool {
        if !self.is_set(offset) {
            return false;
        }
        let (word, bit) = Self::position(offset);
        self.words[word] &= !(1 << bit);
        self.used -= 1;
        true
    }
    
    fn position(offset: u32) -> (usize, u32) {
        ((offset / 64) as usize, offset % 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_first_is_lowest_free() {
        let mut bitmap = BlockBitmap::new(4);
        assert_eq!(bitmap.allocate_first(), Some(0));
        assert_eq!(bitmap.allocate_first(), Some(1));
        assert!(bitmap.clear(0));
        assert_eq!(bitmap.allocate_first(), Some(0));
        assert_eq!(bitmap.allocate_first(), Some(2));
        assert_eq!(bitmap.allocate_first(), Some(3));
        assert_eq!(bitmap.allocate_first(), None);
        assert!(bitmap.is_full());
    }

    #[test]
    fn test_bitmap_crosses_word_boundary() {
        let mut bitmap = BlockBitmap::new(128);
        for expected in 0..70 {
            assert_eq!(bitmap.allocate_first(), Some(expected));
        }
        assert_eq!(bitmap.used(), 70);
        assert_eq!(bitmap.available(), 58);
        assert!(bitmap.is_set(65));
        assert!(bitmap.clear(65));
        assert_eq!(bitmap.allocate_first(), Some(65));
    }

    #[test]
    fn test_set_and_clear_are_idempotent() {
        let mut bitmap = BlockBitmap::new(8);
        assert!(bitmap.set(5));
        assert!(!bitmap.set(5));
        assert_eq!(bitmap.used(), 1);
        assert!(bitmap.clear(5));
        assert!(!bitmap.clear(5));
        assert!(bitmap.is_empty());
        assert!(!bitmap.set(8));
    }

    #[test]
    fn test_partial_word_does_not_overflow_size() {
        let mut bitmap = BlockBitmap::new(2);
        assert_eq!(bitmap.allocate_first(), Some(0));
        assert_eq!(bitmap.allocate_first(), Some(1));
        assert_eq!(bitmap.allocate_first(), None);
    }
}
