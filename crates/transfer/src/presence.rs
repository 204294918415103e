/// Set of chunk indices stored for one transfer, kept as a bitmap.
///
/// Completion is decided here and nowhere else: a transfer is complete when
/// every index in `0..total` has been inserted at least once, however many
/// times any single index was delivered.
#[derive(Debug, Clone)]
pub struct PresenceSet {
    bits: Vec<u64>,
    total: usize,
    received: usize,
}

impl PresenceSet {
    /// Creates an empty set for `total` chunks.
    pub fn new(total: usize) -> Self {
        Self {
            bits: vec![0u64; total.div_ceil(64)],
            total,
            received: 0,
        }
    }

    /// Marks `index` as present. Returns `true` if it was newly inserted.
    ///
    /// Indices outside `0..total` are ignored.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= self.total {
            return false;
        }
        let mask = 1u64 << (index % 64);
        let word = &mut self.bits[index / 64];
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.received += 1;
        true
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        index < self.total && self.bits[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of distinct indices present.
    #[inline]
    pub fn len(&self) -> usize {
        self.received
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.received == 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}
