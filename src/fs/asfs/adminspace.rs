//! Admin-space micro-allocator.
//!
//! Metadata blocks (containers, B-tree nodes, hash tables, soft links) are
//! sub-allocated from 32-block regions so they stay clustered and do not
//! churn the main bitmap. Each region is one [`AdminSpace`] record: a start
//! block and a 32-bit usage mask, MSB first. The records live in a chain of
//! admin-space containers; the whole region is marked used in the main
//! bitmap the moment it is claimed.
//!
//! File data blocks never come from here, they are allocated straight from
//! the bitmap.

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::bitfuncs::bfffz;
use crate::fs::asfs::structs::{
    AdminSpace, AdminSpaceContainerHeader, Be32, BlockId, ADMIN_SPACE_BLOCKS,
    ADMIN_SPACE_CONTAINER_HEADER_SIZE, ADMIN_SPACE_SIZE,
};
use crate::fs::asfs::AsfsVolume;
use crate::fs::IOResult;

impl AsfsVolume {
    fn admin_spaces_per_container(&self) -> usize {
        (self.block_size as usize - ADMIN_SPACE_CONTAINER_HEADER_SIZE) / ADMIN_SPACE_SIZE
    }

    fn admin_space_offset(&self, index: usize) -> usize {
        ADMIN_SPACE_CONTAINER_HEADER_SIZE + index * ADMIN_SPACE_SIZE
    }

    /// Allocates one admin block.
    ///
    /// Walks the container chain for a region with a free slot; when all
    /// regions are full a fresh 32-block region is claimed from the bitmap
    /// and recorded, creating a new container at the start of the new region
    /// if no record slot is left anywhere.
    pub(crate) fn alloc_admin_block(&mut self) -> IOResult<u32> {
        let per_container = self.admin_spaces_per_container();
        let mut container = self.admin_space_container;

        loop {
            let mut bh = self.read_checked(container, BlockId::ADMIN_SPACE_CONTAINER)?;

            for i in 0..per_container {
                let off = self.admin_space_offset(i);
                let mut space: AdminSpace = bh.get(off);

                if space.space.get() == 0 {
                    continue;
                }

                if let Some(bit) = bfffz(space.bits.get(), 0) {
                    let block = space.space.get() + bit;
                    space.bits = Be32::new(space.bits.get() | 1 << (31 - bit));
                    bh.put(off, &space);
                    self.store(&mut bh)?;

                    self.update_root_info(|info| {
                        info.lastallocatedadminspace = Be32::new(container)
                    })?;
                    return Ok(block);
                }
            }

            let header: AdminSpaceContainerHeader = bh.get(0);
            container = header.next.get();
            drop(bh);

            if container == 0 {
                // Every region is full. Claim a new one and record it, then
                // loop so the normal path picks a block out of it.
                container = self.grow_admin_space()?;
            }
        }
    }

    /// Claims a fresh 32-block region and installs its record, returning the
    /// container block the search should continue from.
    fn grow_admin_space(&mut self) -> IOResult<u32> {
        let per_container = self.admin_spaces_per_container();
        let start_block = self.find_and_mark(ADMIN_SPACE_BLOCKS)?;
        let mut container = self.admin_space_container;

        loop {
            let mut bh = self.read_checked(container, BlockId::ADMIN_SPACE_CONTAINER)?;

            let mut free_slot = None;
            for i in 0..per_container {
                let space: AdminSpace = bh.get(self.admin_space_offset(i));
                if space.space.get() == 0 {
                    free_slot = Some(i);
                    break;
                }
            }

            if let Some(i) = free_slot {
                bh.put(
                    self.admin_space_offset(i),
                    &AdminSpace {
                        space: Be32::new(start_block),
                        bits: Be32::ZERO,
                    },
                );
                self.store(&mut bh)?;
                return Ok(container);
            }

            let mut header: AdminSpaceContainerHeader = bh.get(0);
            if header.next.get() == 0 {
                // No record slot anywhere: the new region starts with its own
                // container, which claims the region's first block for
                // itself.
                let mut new_bh =
                    self.zeroed_block(start_block, BlockId::ADMIN_SPACE_CONTAINER);
                let mut new_header: AdminSpaceContainerHeader = new_bh.get(0);
                new_header.previous = Be32::new(container);
                new_header.bits = 32;
                new_bh.put(0, &new_header);
                new_bh.put(
                    self.admin_space_offset(0),
                    &AdminSpace {
                        space: Be32::new(start_block),
                        bits: Be32::new(0x8000_0000),
                    },
                );
                self.store(&mut new_bh)?;

                header.next = Be32::new(start_block);
                bh.put(0, &header);
                self.store(&mut bh)?;

                return Ok(start_block);
            }

            container = header.next.get();
        }
    }

    /// Releases one admin block back to its region.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when no region covers the block.
    pub(crate) fn free_admin_block(&mut self, block: u32) -> CanFail<FsError> {
        let per_container = self.admin_spaces_per_container();
        let mut container = self.admin_space_container;

        loop {
            let mut bh = self.read_checked(container, BlockId::ADMIN_SPACE_CONTAINER)?;

            for i in 0..per_container {
                let off = self.admin_space_offset(i);
                let mut space: AdminSpace = bh.get(off);
                let base = space.space.get();

                if base != 0 && block >= base && block < base + ADMIN_SPACE_BLOCKS {
                    let bit = block - base;
                    space.bits = Be32::new(space.bits.get() & !(1 << (31 - bit)));
                    bh.put(off, &space);
                    return self.store(&mut bh);
                }
            }

            let header: AdminSpaceContainerHeader = bh.get(0);
            container = header.next.get();

            if container == 0 {
                log::error!(
                    target: "asfs",
                    "admin block {block} is covered by no admin-space region"
                );
                return Err(FsError::NotFound);
            }
        }
    }
}
