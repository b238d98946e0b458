/// Double-buffered logical-to-physical index translation for externally
/// allocated numeric buffers.
///
/// Indices below `min_mirrored` map to themselves and are permanently
/// stable; every other index owns two physical slots and an offset selecting
/// the active one. Flipping toggles the offset, so a proposal can write into
/// the inactive half while the committed half stays intact; restoring swaps
/// back to the offsets captured at the last store.
#[derive(Clone, Debug)]
pub struct BufferIndexAllocator {
    min_mirrored: usize,
    offset_count: usize,
    offsets: Vec<usize>,
    stored_offsets: Vec<usize>,
}

impl BufferIndexAllocator {
    /// Allocator for logical indices `0..max_index`, mirroring those at or
    /// above `min_mirrored`.
    ///
    /// # Panics
    /// Panics if `min_mirrored > max_index`.
    pub fn new(max_index: usize, min_mirrored: usize) -> Self {
        assert!(min_mirrored <= max_index);
        let offset_count = max_index - min_mirrored;
        Self {
            min_mirrored,
            offset_count,
            offsets: vec![0; offset_count],
            stored_offsets: vec![0; offset_count],
        }
    }

    /// Number of physical slots backing this allocator: two per mirrored
    /// index plus the unmirrored prefix.
    pub fn buffer_count(&self) -> usize {
        2 * self.offset_count + self.min_mirrored
    }

    /// Toggle the active physical half for `index`. No-op below the
    /// mirrored range.
    pub fn flip(&mut self, index: usize) {
        if index >= self.min_mirrored {
            let offset = &mut self.offsets[index - self.min_mirrored];
            *offset = self.offset_count - *offset;
        }
    }

    /// The physical slot currently backing `index`.
    pub fn current_slot(&self, index: usize) -> usize {
        if index < self.min_mirrored {
            index
        } else {
            self.offsets[index - self.min_mirrored] + index
        }
    }

    /// Capture the current offsets (bulk copy).
    pub fn store(&mut self) {
        self.stored_offsets.copy_from_slice(&self.offsets);
    }

    /// Return every index to the slot it had at the most recent
    /// [`store`](Self::store), regardless of intervening flips.
    pub fn restore(&mut self) {
        std::mem::swap(&mut self.offsets, &mut self.stored_offsets);
    }
}
