//! Soft-link blocks.
//!
//! A soft link's target lives in its own admin block as a NUL-terminated
//! byte string, allocated when the link object is created. The engine stores
//! and returns the bytes verbatim; rewriting Amiga-style volume prefixes is
//! the business of the layer above.

use alloc::vec::Vec;

use crate::errors::{CanFail, FsError};
use crate::fs::asfs::structs::{BlockId, ObjectBits, ObjectDesc, SOFT_LINK_HEADER_SIZE};
use crate::fs::asfs::AsfsVolume;
use crate::fs::IOResult;

impl AsfsVolume {
    fn link_block_of(&self, node: u32) -> IOResult<u32> {
        let (bh, offset) = self.read_object_record(node)?;
        let desc: ObjectDesc = bh.get(offset);

        if !desc.bits.contains(ObjectBits::LINK) || desc.bits.contains(ObjectBits::HARDLINK) {
            return Err(FsError::Invalid);
        }

        let block = desc.file().data.get();
        if block == 0 {
            return Err(FsError::NotFound);
        }
        Ok(block)
    }

    pub(crate) fn read_link(&self, node: u32) -> IOResult<Vec<u8>> {
        let block = self.link_block_of(node)?;
        let bh = self.read_checked(block, BlockId::SOFT_LINK)?;

        let string = &bh.data[SOFT_LINK_HEADER_SIZE..];
        let end = string.iter().position(|&c| c == 0).unwrap_or(string.len());
        Ok(string[..end].to_vec())
    }

    /// Replaces the stored target.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] when the target does not fit the link block.
    pub(crate) fn write_link(&mut self, node: u32, target: &[u8]) -> CanFail<FsError> {
        let block = self.link_block_of(node)?;
        let max_len = self.block_size as usize - SOFT_LINK_HEADER_SIZE - 2;

        if target.len() > max_len {
            return Err(FsError::Invalid);
        }

        let mut bh = self.read_checked(block, BlockId::SOFT_LINK)?;
        bh.data[SOFT_LINK_HEADER_SIZE..].fill(0);
        bh.data[SOFT_LINK_HEADER_SIZE..SOFT_LINK_HEADER_SIZE + target.len()]
            .copy_from_slice(target);

        self.store(&mut bh)
    }
}
