//! File block mapping and truncation.
//!
//! `get_block` is the hook the page cache calls to turn a file-logical block
//! into a device block, growing the file in chunks of at least
//! [`BLOCK_CHUNKS`] blocks when asked to create. The extent consulted last
//! is cached per file, so sequential access walks the chain once.

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::structs::{
    Be32, ExtentBNode, FileInfo, ObjectBits, ObjectDesc, BLOCK_CHUNKS, MAX_FILE_SIZE,
};
use crate::fs::asfs::AsfsVolume;
use crate::fs::IOResult;

/// Cached position within a file's extent chain.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CachedExtent {
    /// File-logical block the cached extent starts at.
    pub(crate) startblock: u32,
    pub(crate) key: u32,
    pub(crate) next: u32,
    pub(crate) blocks: u16,
}

impl AsfsVolume {
    /// Sums the blocks of the chain starting at `first` (0 for no chain).
    pub(crate) fn count_file_blocks(&self, first: u32) -> IOResult<u32> {
        let mut total: u32 = 0;
        let mut key = first;

        while key != 0 {
            let (bh, offset) = self.get_extent(key)?;
            let extent: ExtentBNode = bh.get(offset);
            total += u32::from(extent.blocks.get());
            key = extent.next.get();
        }

        Ok(total)
    }

    pub(crate) fn get_block(&mut self, node: u32, logical: u32, create: bool) -> IOResult<u32> {
        let (bh, offset) = self.read_object_record(node)?;
        let desc: ObjectDesc = bh.get(offset);
        drop(bh);

        if desc.bits.contains(ObjectBits::DIR) || desc.bits.contains(ObjectBits::LINK) {
            return Err(FsError::Invalid);
        }

        let mut first = desc.file().data.get();
        let mut allocated = self.count_file_blocks(first)?;

        if logical >= allocated {
            if !create {
                log::error!(target: "asfs", "block {logical} requested past the end of object {node}");
                return Err(FsError::Io);
            }

            while logical >= allocated {
                let needed = logical - allocated + 1;
                let (_, added) = self.add_blocks_to_file(node, needed.max(BLOCK_CHUNKS))?;
                allocated += added;
                self.extent_cache.remove(&node);
            }

            let (bh, offset) = self.read_object_record(node)?;
            first = bh.get::<ObjectDesc>(offset).file().data.get();
        }

        // Walk the chain towards `logical`, resuming from the cached extent
        // when it lies at or before the target.
        let cached = self
            .extent_cache
            .get(&node)
            .copied()
            .filter(|c| c.startblock <= logical);

        let (mut pos, mut key, mut next, mut blocks) = match cached {
            Some(c) => (c.startblock, c.key, c.next, c.blocks),
            None => {
                let (bh, offset) = self.get_extent(first)?;
                let extent: ExtentBNode = bh.get(offset);
                (0, extent.key.get(), extent.next.get(), extent.blocks.get())
            }
        };

        while pos + u32::from(blocks) <= logical && next != 0 {
            pos += u32::from(blocks);

            let (bh, offset) = self.get_extent(next)?;
            let extent: ExtentBNode = bh.get(offset);
            key = extent.key.get();
            next = extent.next.get();
            blocks = extent.blocks.get();
        }

        self.extent_cache.insert(
            node,
            CachedExtent {
                startblock: pos,
                key,
                next,
                blocks,
            },
        );

        Ok(key + (logical - pos))
    }

    /// Shrinks the file behind `node` to `new_size` bytes. Growing is a
    /// no-op: sizes beyond the allocated space are left to
    /// `get_block(create)`.
    pub(crate) fn truncate(&mut self, node: u32, new_size: u32) -> CanFail<FsError> {
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::Invalid);
        }

        let (bh, offset) = self.read_object_record(node)?;
        let desc: ObjectDesc = bh.get(offset);
        drop(bh);

        if desc.bits.contains(ObjectBits::DIR) || desc.bits.contains(ObjectBits::LINK) {
            return Err(FsError::Invalid);
        }

        let allocated = self.count_file_blocks(desc.file().data.get())?;
        if u64::from(new_size) > u64::from(allocated) * u64::from(self.block_size) {
            log::warn!(target: "asfs", "enlarging object {node} through truncate is not supported");
            return Ok(());
        }

        self.truncate_blocks_in_file(node, new_size)?;

        let (mut bh, offset) = self.read_object_record(node)?;
        let mut desc: ObjectDesc = bh.get(offset);
        desc.set_file(FileInfo {
            data: desc.file().data,
            size: Be32::new(new_size),
        });
        bh.put(offset, &desc);
        self.store(&mut bh)?;

        self.extent_cache.remove(&node);
        Ok(())
    }
}
