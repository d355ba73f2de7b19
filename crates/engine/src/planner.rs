//! Chunk planning for multi-part downloads

/// Hard cap on the number of chunks in one plan.
pub const MAX_CHUNKS: u32 = 32;

const MB: u64 = 1024 * 1024;

/// One contiguous byte range of the destination, assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Chunk index (0-based)
    pub index: u32,
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
    /// Bytes already downloaded for this chunk
    pub downloaded: u64,
    /// Set once the chunk's full range is on disk
    pub complete: bool,
}

impl ChunkSpec {
    /// Returns the size of this chunk in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Returns the number of bytes remaining to download
    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.downloaded)
    }

    /// Returns the next absolute byte position to download from
    pub fn resume_position(&self) -> u64 {
        self.start + self.downloaded
    }
}

/// Chunk count for a file of `total` bytes.
///
/// Small files stay on a single stream; the count steps up with size and
/// never exceeds [`MAX_CHUNKS`].
pub fn chunk_count_for(total: u64) -> u32 {
    if total <= MB {
        1
    } else if total < 10 * MB {
        2
    } else if total < 50 * MB {
        4
    } else if total < 100 * MB {
        8
    } else if total < 500 * MB {
        16
    } else {
        (total / MB).min(u64::from(MAX_CHUNKS)) as u32
    }
}

/// Partitions `[0, total - 1]` into a chunk plan.
///
/// `override_count` replaces the size-based policy and is clamped to
/// `[1, MAX_CHUNKS]`. An unknown or zero total yields a single chunk
/// standing for the whole stream.
pub fn plan_chunks(total: Option<u64>, override_count: Option<u32>) -> Vec<ChunkSpec> {
    let total = match total {
        Some(t) if t > 0 => t,
        // zero-length or unknown: one whole-stream chunk
        _ => {
            return vec![ChunkSpec {
                index: 0,
                start: 0,
                end: 0,
                downloaded: 0,
                complete: false,
            }]
        }
    };

    let count = override_count
        .map(|c| c.clamp(1, MAX_CHUNKS))
        .unwrap_or_else(|| chunk_count_for(total));
    // never hand out empty ranges
    let count = u64::from(count).min(total);

    let base = total / count;
    let remainder = total % count;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;

    for i in 0..count {
        let size = base + u64::from(i < remainder);
        let end = if i == count - 1 {
            total - 1 // guard against arithmetic drift
        } else {
            start + size - 1
        };

        chunks.push(ChunkSpec {
            index: i as u32,
            start,
            end,
            downloaded: 0,
            complete: false,
        });

        start = end + 1;
    }

    chunks
}
