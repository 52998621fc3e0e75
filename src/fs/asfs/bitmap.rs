//! Free-block bitmap.
//!
//! The bitmap starts at `bitmap_base` and covers the whole volume with one
//! bit per block, set meaning free. Bits are MSB-first within big-endian
//! words, so bit 0 of the volume is the high bit of the first word.
//!
//! The cached free-block count in the root info trailer is written before
//! bits are cleared on allocation, and after bits are set on free, so a crash
//! can leave the counter low but never high.

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::bitfuncs::{bmclr, bmffo, bmffz, bmset};
use crate::fs::asfs::structs::{BlockId, ALWAYS_FREE, BITMAP_HEADER_SIZE};
use crate::fs::asfs::AsfsVolume;
use crate::fs::IOResult;

impl AsfsVolume {
    fn bitmap_longs(&self) -> usize {
        (self.block_size as usize - BITMAP_HEADER_SIZE) >> 2
    }

    /// Writes the cached free-block count through to the root info trailer.
    pub(crate) fn set_free_blocks(&mut self, free: u32) -> CanFail<FsError> {
        self.free_blocks = free;
        self.update_root_info(|info| info.freeblocks = free.into())
    }

    /// Whether `blocks` can be taken without violating the free reserve.
    pub(crate) fn enough_space(&self, blocks: u32) -> bool {
        self.free_blocks >= ALWAYS_FREE && self.free_blocks - ALWAYS_FREE >= blocks
    }

    /// Counts the free blocks starting at `block`, stopping early once
    /// `max_needed` have been seen or an allocated block is hit.
    fn available_space(&self, block: u32, max_needed: u32) -> IOResult<u32> {
        let longs = self.bitmap_longs();
        let max_bitmap_block = self.bitmap_base + self.bitmap_blocks;
        let mut found: u32 = 0;
        let mut bitstart = (block % self.blocks_in_bitmap) as usize;
        let mut next_block = self.bitmap_base + block / self.blocks_in_bitmap;

        while next_block < max_bitmap_block {
            let bh = self.read_checked(next_block, BlockId::BITMAP)?;
            next_block += 1;

            let area = &bh.data[BITMAP_HEADER_SIZE..];
            if let Some(bitend) = bmffz(area, longs, bitstart) {
                found += (bitend - bitstart) as u32;
                return Ok(found);
            }

            found += self.blocks_in_bitmap - bitstart as u32;
            if found >= max_needed {
                return Ok(found);
            }
            bitstart = 0;
        }

        Ok(found)
    }

    /// Sweeps the bitmap for the longest run of free blocks, starting at
    /// `start` and wrapping at the end of the volume when `start >= end`.
    ///
    /// Returns the run start and its length, capped at `max_needed`; the
    /// sweep stops early as soon as a run of `max_needed` blocks is seen.
    ///
    /// # Errors
    ///
    /// [`FsError::NoSpace`] when no free run exists or the reserve would be
    /// violated.
    pub(crate) fn find_space(
        &self,
        max_needed: u32,
        start: u32,
        end: u32,
    ) -> IOResult<(u32, u32)> {
        if !self.enough_space(max_needed) {
            return Err(FsError::NoSpace);
        }

        let longs = self.bitmap_longs();
        let bib = self.blocks_in_bitmap;

        let mut start = start;
        if start >= self.total_blocks {
            start -= self.total_blocks;
        }
        let end = if end == 0 { self.total_blocks } else { end };

        let mut reads = (end - 1) / bib + 1 - start / bib;
        if start >= end {
            reads += (self.total_blocks - 1) / bib + 1;
        }

        let mut breakpoint = if start < end { end } else { self.total_blocks };

        let mut best_block: u32 = 0;
        let mut best_blocks: u32 = 0;
        let mut space: u32 = 0;

        let mut bitend = (start % bib) as usize;
        let mut block = start - bitend as u32;
        let mut bitmap_block = self.bitmap_base + start / bib;

        loop {
            let bh = self.read_checked(bitmap_block, BlockId::BITMAP)?;
            bitmap_block += 1;

            let area = &bh.data[BITMAP_HEADER_SIZE..];
            let local_breakpoint =
                usize::min(breakpoint.saturating_sub(block) as usize, bib as usize);

            // `space` carries the free run length from the tail of the
            // previous bitmap block; it resets whenever a run does not start
            // at the first bit of this block.
            loop {
                let Some(bitstart) = bmffo(area, longs, bitend) else {
                    break;
                };
                if bitstart >= local_breakpoint {
                    break;
                }
                if bitstart != 0 {
                    space = 0;
                }

                bitend = bmffz(area, longs, bitstart).unwrap_or(bib as usize);
                if bitend > local_breakpoint {
                    bitend = local_breakpoint;
                }

                space += (bitend - bitstart) as u32;

                if best_blocks < space {
                    best_block = block + bitend as u32 - space;
                    if space >= max_needed {
                        return Ok((best_block, max_needed));
                    }
                    best_blocks = space;
                }

                if bitend >= local_breakpoint {
                    break;
                }
            }

            reads -= 1;
            if reads == 0 {
                break;
            }

            if bitend != bib as usize {
                space = 0;
            }

            bitend = 0;
            block += bib;

            if block >= self.total_blocks {
                block = 0;
                space = 0;
                breakpoint = end;
                bitmap_block = self.bitmap_base;
            }
        }

        if best_blocks == 0 {
            Err(FsError::NoSpace)
        } else {
            Ok((best_block, best_blocks))
        }
    }

    /// Marks the run `[block, block + blocks)` allocated.
    ///
    /// # Errors
    ///
    /// [`FsError::Io`] when part of the run is already allocated; that is
    /// corruption and nothing is mutated.
    pub(crate) fn mark_space(&mut self, block: u32, blocks: u32) -> CanFail<FsError> {
        if self.available_space(block, blocks)? < blocks {
            log::error!(
                target: "asfs",
                "tried to mark {blocks} blocks from block {block}, but some were already full"
            );
            return Err(FsError::Io);
        }

        self.set_free_blocks(self.free_blocks.saturating_sub(blocks))?;

        let longs = self.bitmap_longs();
        let skip = block / self.blocks_in_bitmap;
        let mut bit = (block - skip * self.blocks_in_bitmap) as usize;
        let mut bitmap_block = self.bitmap_base + skip;
        let mut remaining = blocks as usize;

        while remaining > 0 {
            let mut bh = self.read_checked(bitmap_block, BlockId::BITMAP)?;
            bitmap_block += 1;

            let cleared = bmclr(&mut bh.data[BITMAP_HEADER_SIZE..], longs, bit, remaining);
            remaining -= cleared;
            bit = 0;

            self.store(&mut bh)?;
        }

        Ok(())
    }

    /// Returns the run `[block, block + blocks)` to the free pool.
    pub(crate) fn free_space(&mut self, block: u32, blocks: u32) -> CanFail<FsError> {
        let longs = self.bitmap_longs();
        let skip = block / self.blocks_in_bitmap;
        let mut bit = (block - skip * self.blocks_in_bitmap) as usize;
        let mut bitmap_block = self.bitmap_base + skip;
        let mut remaining = blocks as usize;

        while remaining > 0 {
            let mut bh = self.read_checked(bitmap_block, BlockId::BITMAP)?;
            bitmap_block += 1;

            let set = bmset(&mut bh.data[BITMAP_HEADER_SIZE..], longs, bit, remaining);
            remaining -= set;
            bit = 0;

            self.store(&mut bh)?;
        }

        self.set_free_blocks(self.free_blocks + blocks)
    }

    /// Finds an exact run of `blocks` free blocks anywhere on the volume and
    /// marks it allocated.
    pub(crate) fn find_and_mark(&mut self, blocks: u32) -> IOResult<u32> {
        if !self.enough_space(blocks) {
            return Err(FsError::NoSpace);
        }

        let (start, found) = self.find_space(blocks, 0, self.total_blocks)?;
        if found != blocks {
            return Err(FsError::NoSpace);
        }

        self.mark_space(start, blocks)?;
        Ok(start)
    }
}
