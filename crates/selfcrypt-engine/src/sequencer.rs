//! Out-of-order write buffering.
//!
//! The sequencer holds byte runs that cannot yet be placed into the encrypt
//! queue, keyed by absolute file offset. Overlapping or touching runs are
//! coalesced on insert, newest bytes winning, so at any moment the stored
//! blocks are disjoint and sorted.

use std::collections::BTreeMap;

/// Ordered map from file offset to an owned byte run.
#[derive(Debug, Default)]
pub struct Sequencer {
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `data` at `position`, merging with any overlapping or adjacent
    /// blocks. Where ranges overlap, the new bytes replace the old.
    pub fn add(&mut self, data: &[u8], position: u64) {
        if data.is_empty() {
            return;
        }
        let end = position + data.len() as u64;

        // Collect every block that overlaps or touches [position, end).
        let merge_keys: Vec<u64> = self
            .blocks
            .iter()
            .filter(|(&start, block)| start <= end && start + block.len() as u64 >= position)
            .map(|(&start, _)| start)
            .collect();

        let mut merged_start = position;
        let mut merged_end = end;
        for &start in &merge_keys {
            let block_end = start + self.blocks[&start].len() as u64;
            merged_start = merged_start.min(start);
            merged_end = merged_end.max(block_end);
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for start in merge_keys {
            let block = self.blocks.remove(&start).expect("key collected above");
            let offset = (start - merged_start) as usize;
            merged[offset..offset + block.len()].copy_from_slice(&block);
        }
        let offset = (position - merged_start) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        self.blocks.insert(merged_start, merged);
    }

    /// Remove and return the block starting exactly at `position`.
    pub fn get(&mut self, position: u64) -> Option<Vec<u8>> {
        self.blocks.remove(&position)
    }

    /// Remove and return the lowest-offset block.
    pub fn get_first(&mut self) -> Option<(u64, Vec<u8>)> {
        self.blocks.pop_first()
    }

    /// The block whose range contains `position`, or failing that the next
    /// block after it. Does not remove.
    pub fn peek(&self, position: u64) -> Option<(u64, &[u8])> {
        if let Some((&start, block)) = self.blocks.range(..=position).next_back() {
            if start + block.len() as u64 > position {
                return Some((start, block.as_slice()));
            }
        }
        self.blocks
            .range(position + 1..)
            .next()
            .map(|(&start, block)| (start, block.as_slice()))
    }

    /// Drop any buffered bytes inside `[start, end)`, splitting blocks that
    /// straddle the boundary. Used when newer bytes for a range land in the
    /// encrypt queue and would otherwise be shadowed by stale buffered data.
    pub fn remove_range(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let affected: Vec<u64> = self
            .blocks
            .iter()
            .filter(|(&bstart, block)| bstart < end && bstart + block.len() as u64 > start)
            .map(|(&bstart, _)| bstart)
            .collect();

        for bstart in affected {
            let block = self.blocks.remove(&bstart).expect("key collected above");
            let bend = bstart + block.len() as u64;
            if bstart < start {
                let keep = (start - bstart) as usize;
                self.blocks.insert(bstart, block[..keep].to_vec());
            }
            if bend > end {
                let from = (end - bstart) as usize;
                self.blocks.insert(end, block[from..].to_vec());
            }
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of disjoint blocks currently held.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
