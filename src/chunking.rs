use crate::error::{CdlError, Result};
use log::debug;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBounds {
    pub index: usize,
    pub name: String,
    /// Parcel rows `[start, end)` in input order.
    pub rows: Range<usize>,
}

impl ChunkBounds {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fixed-size ordered partition of `total` parcels.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: usize,
    chunk_size: usize,
    pub total_chunks: usize,
}

impl ChunkPlan {
    pub fn new(total: usize, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CdlError::InvalidChunkSize(chunk_size));
        }

        // Calculate number of chunks needed (ceiling division)
        let total_chunks = (total + chunk_size - 1) / chunk_size;

        debug!(
            "ChunkPlan: {} parcels, chunk_size={} → {} chunks",
            total, chunk_size, total_chunks
        );

        Ok(Self {
            total,
            chunk_size,
            total_chunks,
        })
    }

    pub fn chunk_name(chunk_idx: usize) -> String {
        format!("chunk_{}", chunk_idx)
    }

    /// Index of a name produced by `chunk_name`.
    pub fn parse_chunk_name(name: &str) -> Option<usize> {
        let digits = name.strip_prefix("chunk_")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn iter(&self) -> ChunkIterator<'_> {
        ChunkIterator::new(self)
    }

    pub fn get_chunk_bounds(&self, chunk_idx: usize) -> ChunkBounds {
        let start = (chunk_idx * self.chunk_size).min(self.total);
        let end = ((chunk_idx + 1) * self.chunk_size).min(self.total);

        ChunkBounds {
            index: chunk_idx,
            name: Self::chunk_name(chunk_idx),
            rows: start..end,
        }
    }
}

pub struct ChunkIterator<'a> {
    plan: &'a ChunkPlan,
    current_idx: usize,
}

impl<'a> ChunkIterator<'a> {
    fn new(plan: &'a ChunkPlan) -> Self {
        Self {
            plan,
            current_idx: 0,
        }
    }
}

impl<'a> Iterator for ChunkIterator<'a> {
    type Item = ChunkBounds;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx < self.plan.total_chunks {
            let bounds = self.plan.get_chunk_bounds(self.current_idx);
            self.current_idx += 1;
            Some(bounds)
        } else {
            None
        }
    }
}
