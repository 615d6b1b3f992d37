//! Null bitmap for NBCROW decoding.

/// Null bitmap of the current row.
///
/// A column count of zero means the current row is not null-bitmap
/// compressed. A set bit marks the column null; a clear bit says nothing,
/// because servers may still send a null through the column's normal
/// encoding.
#[derive(Debug, Clone, Default)]
pub struct NullBitmap {
    bits: Vec<u8>,
    column_count: usize,
}

impl NullBitmap {
    /// Bitmap length in bytes for `column_count` columns.
    #[must_use]
    pub const fn byte_len(column_count: usize) -> usize {
        column_count.div_ceil(8)
    }

    /// Load the bitmap of an NBC row.
    pub fn initialize(&mut self, column_count: usize, bits: &[u8]) {
        debug_assert_eq!(bits.len(), Self::byte_len(column_count));
        self.bits.clear();
        self.bits.extend_from_slice(bits);
        self.column_count = column_count;
    }

    /// Forget the current row.
    pub fn clean(&mut self) {
        self.bits.clear();
        self.column_count = 0;
    }

    /// Whether a row bitmap is loaded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.column_count != 0
    }

    /// Column count of the loaded bitmap.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// True only when the bitmap proves `column` null.
    #[must_use]
    pub fn is_guaranteed_null(&self, column: usize) -> bool {
        if column >= self.column_count {
            return false;
        }
        self.bits
            .get(column / 8)
            .is_some_and(|byte| byte & (1 << (column % 8)) != 0)
    }
}
